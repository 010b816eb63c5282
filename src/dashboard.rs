//! Box ops dashboard.
//! Workers (assignment pools per worker)
//! Tasks (task assignments routed to this box)
//! Activity (latest assignment status changes)

use std::{
  error::Error,
  io,
  sync::{Arc},
  thread,
  time::{Duration, Instant},
};

use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};
use sqlx::{Pool, Postgres};
use lapin::Channel;
use tokio::runtime::Runtime;

use karya::config::BoxConfig;
use karya::database::setup_database;
use karya::messaging::{create_rabbit_channel, REPLENISH_QUEUE};

struct WorkerPoolInfo {
  worker_id: i64,
  name: String,
  assigned: i64,
  preassigned: i64,
  finished: i64,
}

struct RoutedTask {
  task_id: i64,
  name: String,
  language: String,
  status: String,
}

struct ActivityEntry {
  assignment_id: i64,
  worker_id: i64,
  status: String,
  at: String,
}

#[derive(Clone, Copy)]
enum DashboardTab {
  Workers,
  Tasks,
  Activity,
}

struct App {
  current_tab: DashboardTab,
  workers: Vec<WorkerPoolInfo>,
  tasks: Vec<RoutedTask>,
  activity: Vec<ActivityEntry>,
  pending_replenish: u32,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Workers,
      workers: vec![],
      tasks: vec![],
      activity: vec![],
      pending_replenish: 0,
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Workers => DashboardTab::Tasks,
      DashboardTab::Tasks => DashboardTab::Activity,
      DashboardTab::Activity => DashboardTab::Workers,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Workers => DashboardTab::Activity,
      DashboardTab::Tasks => DashboardTab::Workers,
      DashboardTab::Activity => DashboardTab::Tasks,
    }
  }
}

async fn fetch_db_state(pool: &Pool<Postgres>) -> Result<App, sqlx::Error> {
  let mut app = App::new();

  let worker_rows: Vec<(i64, Option<String>, i64, i64, i64)> = sqlx::query_as(
    r#"
        SELECT
            w.id,
            w.full_name,
            COUNT(a.id) FILTER (WHERE a.status = 'ASSIGNED'),
            COUNT(a.id) FILTER (WHERE a.status = 'PREASSIGNED'),
            COUNT(a.id) FILTER (WHERE a.status IN ('COMPLETED', 'SUBMITTED', 'VERIFIED'))
        FROM worker w
        LEFT JOIN microtask_assignment a ON a.worker_id = w.id
        GROUP BY w.id, w.full_name
        ORDER BY w.id
        "#,
  )
  .fetch_all(pool)
  .await?;
  app.workers = worker_rows
    .into_iter()
    .map(|(worker_id, name, assigned, preassigned, finished)| WorkerPoolInfo {
      worker_id,
      name: name.unwrap_or_else(|| "N/A".into()),
      assigned,
      preassigned,
      finished,
    })
    .collect();

  let task_rows: Vec<(i64, String, String, String)> = sqlx::query_as(
    r#"
        SELECT t.id, t.name, t.language, ta.status::text
        FROM task_assignment ta
        JOIN task t ON t.id = ta.task_id
        ORDER BY ta.created_at DESC
        LIMIT 10
        "#,
  )
  .fetch_all(pool)
  .await?;
  app.tasks = task_rows
    .into_iter()
    .map(|(task_id, name, language, status)| RoutedTask { task_id, name, language, status })
    .collect();

  let activity_rows: Vec<(i64, i64, String, Option<String>)> = sqlx::query_as(
    r#"
        SELECT a.id, a.worker_id, a.status::text,
               to_char(a.last_updated_at, 'YYYY-MM-DD HH24:MI:SS')
        FROM microtask_assignment a
        ORDER BY a.last_updated_at DESC
        LIMIT 20
        "#,
  )
  .fetch_all(pool)
  .await?;
  app.activity = activity_rows
    .into_iter()
    .map(|(assignment_id, worker_id, status, at)| ActivityEntry {
      assignment_id,
      worker_id,
      status,
      at: at.unwrap_or_else(|| "N/A".into()),
    })
    .collect();

  Ok(app)
}

async fn fetch_rabbitmq_state(channel: &Channel) -> Result<u32, lapin::Error> {
  let queue = channel
    .queue_declare(REPLENISH_QUEUE, lapin::options::QueueDeclareOptions { passive: true, ..Default::default() }, lapin::types::FieldTable::default())
    .await?;
  Ok(queue.message_count())
}

fn main() -> Result<(), Box<dyn Error>> {
  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let config = BoxConfig::from_env();
  let rt = Runtime::new()?;
  let db_pool = rt.block_on(setup_database(&config.database_url));
  let rabbit_channel = rt.block_on(create_rabbit_channel(&config.rabbitmq_url))
    .expect("Failed to create RabbitMQ channel");

  let db_pool_arc = Arc::new(db_pool);
  let rabbit_channel_arc = Arc::new(rabbit_channel);

  let (tx, rx) = std::sync::mpsc::channel::<App>();

  {
    let db_pool_clone = db_pool_arc.clone();
    let rabbit_channel_clone = rabbit_channel_arc.clone();
    thread::spawn(move || {
      let rt_bg = Runtime::new().unwrap();
      loop {
        let mut app_state = rt_bg.block_on(fetch_db_state(&db_pool_clone)).unwrap_or_else(|_| App::new());
        let pending = rt_bg.block_on(fetch_rabbitmq_state(&rabbit_channel_clone)).unwrap_or(0);
        app_state.pending_replenish = pending;
        let _ = tx.send(app_state);
        thread::sleep(Duration::from_secs(2));
      }
    });
  }

  let mut app = App::new();
  if let Ok(state) = rx.try_recv() {
    app = state;
  }

  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(new_state) = rx.try_recv() {
      app = new_state;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Workers", "Tasks", "Activity"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow)))
      )
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("Box Dashboard"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Workers => 0,
      DashboardTab::Tasks => 1,
      DashboardTab::Activity => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Workers => render_workers(f, app, chunks[1]),
    DashboardTab::Tasks => render_tasks(f, app, chunks[1]),
    DashboardTab::Activity => render_activity(f, app, chunks[1]),
  }

  let footer = Paragraph::new("←/→: Switch Tabs | q: Quit")
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_workers<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(60), Constraint::Percentage(40)].as_ref())
    .split(area);

  let worker_items: Vec<ListItem> = app.workers.iter().map(|w| {
    let lines = vec![
      Spans::from(Span::styled(format!("Worker {}: {}", w.worker_id, w.name), Style::default().add_modifier(Modifier::BOLD))),
      Spans::from(Span::raw(format!("Assigned: {} | Pool: {} | Finished: {}", w.assigned, w.preassigned, w.finished))),
    ];
    ListItem::new(lines)
  }).collect();

  let workers_list = List::new(worker_items)
    .block(Block::default().borders(Borders::ALL).title("Worker Pools"))
    .highlight_style(Style::default().bg(Color::Blue));
  f.render_widget(workers_list, chunks[0]);

  let empty_pools: Vec<ListItem> = app.workers.iter().filter(|w| w.preassigned == 0).map(|w| {
    ListItem::new(Spans::from(vec![
      Span::raw(format!("Worker {} has an empty pool", w.worker_id))
    ]))
  }).collect();
  let header = format!("Replenish Queue (pending: {})", app.pending_replenish);
  let empty_list = List::new(if empty_pools.is_empty() { vec![ListItem::new(Spans::from(Span::raw("All pools stocked")))] } else { empty_pools })
    .block(Block::default().borders(Borders::ALL).title(header));
  f.render_widget(empty_list, chunks[1]);
}

fn render_tasks<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let task_items: Vec<ListItem> = app.tasks.iter().map(|t| {
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{} ", t.task_id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
      Span::raw(format!("{} | Language: {} | Status: {}", t.name, t.language, t.status))
    ]))
  }).collect();
  let tasks_list = List::new(task_items)
    .block(Block::default().borders(Borders::ALL).title("Tasks Routed to This Box"));
  f.render_widget(tasks_list, area);
}

fn render_activity<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let activity_items: Vec<ListItem> = app.activity.iter().map(|a| {
    ListItem::new(Spans::from(vec![
      Span::styled(a.at.clone(), Style::default().fg(Color::Green)),
      Span::raw(" - "),
      Span::raw(format!("assignment {} (worker {}) -> {}", a.assignment_id, a.worker_id, a.status)),
    ]))
  }).collect();
  let activity_list = List::new(activity_items)
    .block(Block::default().borders(Borders::ALL).title("Latest Assignment Activity"));
  f.render_widget(activity_list, area);
}
