//! HTTP client used by the tiers that dial upward: the worker device
//! talking to its box, and the box cron talking to the server. Wire
//! request/response shapes shared with the route handlers live here.

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;

use crate::assignment::{AssignmentBundle, WorkerSummary};
use crate::models::{BoxRecord, KaryaFileRecord, MicrotaskAssignmentRecord, WorkerRecord};
use crate::sync::{RecordResult, TableUpdates};

pub const ID_TOKEN_HEADER: &str = "karya-id-token";
pub const WORKER_ID_HEADER: &str = "karya-worker-id";
pub const BOX_ID_HEADER: &str = "karya-box-id";

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterBoxRequest {
  pub creation_code: String,
  pub name: String,
  pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckinResponse {
  pub key: String,
}

/// One-shot worker registration: the whole draft travels in a single
/// request instead of accumulating in shared mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
  pub access_code: String,
  pub phone_number: Option<String>,
  pub full_name: Option<String>,
  pub year_of_birth: Option<String>,
  pub gender: Option<String>,
  pub app_language: Option<String>,
  pub skills: Vec<SkillDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDraft {
  pub language: String,
  pub can_speak: bool,
  pub can_read: bool,
  pub can_type: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadFileQuery {
  pub container: String,
  pub name: String,
  pub checksum: String,
}

pub struct ApiClient {
  base: String,
  id_header: &'static str,
  id: i64,
  token: String,
  client: reqwest::Client,
}

impl ApiClient {
  pub fn for_worker(box_url: &str, worker_id: i64, id_token: &str) -> Self {
    Self::new(box_url, WORKER_ID_HEADER, worker_id, id_token)
  }

  pub fn for_box(server_url: &str, box_id: i64, key: &str) -> Self {
    Self::new(server_url, BOX_ID_HEADER, box_id, key)
  }

  fn new(base: &str, id_header: &'static str, id: i64, token: &str) -> Self {
    Self {
      base: base.trim_end_matches('/').to_string(),
      id_header,
      id,
      token: token.to_string(),
      client: reqwest::Client::new(),
    }
  }

  pub fn set_token(&mut self, token: String) {
    self.token = token;
  }

  fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
    self
      .client
      .request(method, format!("{}{}", self.base, path))
      .header(self.id_header, self.id)
      .header(ID_TOKEN_HEADER, &self.token)
  }

  async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
    let response = self
      .request(reqwest::Method::GET, path)
      .query(query)
      .send()
      .await
      .with_context(|| format!("GET {}", path))?
      .error_for_status()?;
    Ok(response.json().await?)
  }

  async fn put_json<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
    let response = self
      .request(reqwest::Method::PUT, path)
      .json(body)
      .send()
      .await
      .with_context(|| format!("PUT {}", path))?
      .error_for_status()?;
    Ok(response.json().await?)
  }

  // Worker -> box operations.

  pub async fn get_new_assignments(&self, from: DateTime<Utc>) -> Result<AssignmentBundle> {
    self
      .get_json(
        "/api/worker/assignments",
        &[("kind", "new".into()), ("from", from.to_rfc3339())],
      )
      .await
  }

  pub async fn get_verified_assignments(
    &self,
    from: DateTime<Utc>,
  ) -> Result<Vec<MicrotaskAssignmentRecord>> {
    self
      .get_json(
        "/api/worker/assignments",
        &[("kind", "verified".into()), ("from", from.to_rfc3339())],
      )
      .await
  }

  pub async fn submit_assignments(
    &self,
    reports: &[MicrotaskAssignmentRecord],
  ) -> Result<Vec<i64>> {
    self.put_json("/api/worker/assignments", reports).await
  }

  pub async fn push_worker_updates(&self, updates: &[TableUpdates]) -> Result<Vec<RecordResult>> {
    self.put_json("/api/worker/updates", updates).await
  }

  pub async fn pull_worker_updates(&self, from: DateTime<Utc>) -> Result<Vec<TableUpdates>> {
    self
      .get_json("/api/worker/updates", &[("from", from.to_rfc3339())])
      .await
  }

  pub async fn get_summary(&self) -> Result<WorkerSummary> {
    self.get_json("/api/worker/summary", &[]).await
  }

  pub async fn upload_output_file(
    &self,
    assignment_id: i64,
    name: &str,
    checksum: &str,
    payload: Vec<u8>,
  ) -> Result<KaryaFileRecord> {
    let response = self
      .request(
        reqwest::Method::POST,
        &format!("/api/worker/assignments/{assignment_id}/output_file"),
      )
      .query(&[("name", name), ("checksum", checksum)])
      .body(payload)
      .send()
      .await
      .context("uploading output file")?
      .error_for_status()?;
    Ok(response.json().await?)
  }

  pub async fn download_input_file(&self, microtask_id: i64) -> Result<Bytes> {
    let response = self
      .request(
        reqwest::Method::GET,
        &format!("/api/worker/microtasks/{microtask_id}/input_file"),
      )
      .send()
      .await
      .context("downloading input file")?
      .error_for_status()?;
    Ok(response.bytes().await?)
  }

  // Box -> server operations.

  pub async fn checkin(&self) -> Result<CheckinResponse> {
    self.put_json("/api/box/checkin", &serde_json::json!({})).await
  }

  pub async fn push_box_updates(&self, updates: &[TableUpdates]) -> Result<Vec<RecordResult>> {
    self.put_json("/api/box/updates", updates).await
  }

  pub async fn pull_box_updates(&self, from: DateTime<Utc>) -> Result<Vec<TableUpdates>> {
    self
      .get_json("/api/box/updates", &[("from", from.to_rfc3339())])
      .await
  }

  pub async fn upload_file(
    &self,
    query: &UploadFileQuery,
    payload: Vec<u8>,
  ) -> Result<KaryaFileRecord> {
    let response = self
      .request(reqwest::Method::POST, "/api/karya_file")
      .query(&[
        ("container", query.container.as_str()),
        ("name", query.name.as_str()),
        ("checksum", query.checksum.as_str()),
      ])
      .body(payload)
      .send()
      .await
      .context("uploading karya file")?
      .error_for_status()?;
    Ok(response.json().await?)
  }

  pub async fn download_file(&self, file_id: i64) -> Result<Bytes> {
    let response = self
      .request(reqwest::Method::GET, &format!("/api/karya_file/{file_id}"))
      .send()
      .await
      .context("downloading karya file")?
      .error_for_status()?;
    Ok(response.bytes().await?)
  }
}

/// One-time box provisioning; runs before the box holds any credentials.
pub async fn register_box(server_url: &str, request: &RegisterBoxRequest) -> Result<BoxRecord> {
  let response = reqwest::Client::new()
    .post(format!("{}/api/box/register", server_url.trim_end_matches('/')))
    .json(request)
    .send()
    .await
    .context("registering box")?
    .error_for_status()?;
  Ok(response.json().await?)
}

/// One-time worker registration against a box.
pub async fn register_worker(
  box_url: &str,
  request: &RegisterWorkerRequest,
) -> Result<WorkerRecord> {
  let response = reqwest::Client::new()
    .post(format!("{}/api/worker/register", box_url.trim_end_matches('/')))
    .json(request)
    .send()
    .await
    .context("registering worker")?
    .error_for_status()?;
  Ok(response.json().await?)
}
