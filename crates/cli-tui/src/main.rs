use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use pocketvid::tools::{usage_for_path, DiskUsage};
use pocketvid::{ConverterConfig, JobRecord, JobState, JobStore};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::{Disks, System};
use humansize::{format_size, DECIMAL};

struct App {
    jobs: Vec<JobRecord>,
    system: System,
    disk: Option<DiskUsage>,
    table_state: TableState,
    should_quit: bool,
    store: JobStore,
    scratch_dir: PathBuf,
    threshold_bytes: u64,
}

impl App {
    fn new(store: JobStore, scratch_dir: PathBuf, threshold_bytes: u64) -> Self {
        Self {
            jobs: Vec::new(),
            system: System::new(),
            disk: None,
            table_state: TableState::default(),
            should_quit: false,
            store,
            scratch_dir,
            threshold_bytes,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disk = usage_for_path(&Disks::new_with_refreshed_list(), &self.scratch_dir);

        // A missing or corrupt store reads as empty
        self.jobs = self.store.list_all();
        self.jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    }

    fn count_by_state(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = ConverterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    let store = JobStore::open(&cfg.state_file)
        .with_context(|| format!("Failed to open job store: {}", cfg.state_file.display()))?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(store, cfg.scratch_dir.clone(), cfg.disk_threshold_bytes());

    loop {
        app.refresh();
        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(500))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => app.should_quit = true,
                    crossterm::event::KeyCode::Down => select_next(&mut app, 1),
                    crossterm::event::KeyCode::Up => select_next(&mut app, -1),
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

/// pocketvid job monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn select_next(app: &mut App, step: isize) {
    if app.jobs.is_empty() {
        app.table_state.select(None);
        return;
    }
    let last = app.jobs.len() as isize - 1;
    let current = app.table_state.selected().map(|i| i as isize).unwrap_or(-1);
    let next = (current + step).clamp(0, last);
    app.table_state.select(Some(next as usize));
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_job_table(f, app, chunks[1]);
    render_status_bar(f, app, chunks[2]);
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    let cpu_raw = app.system.global_cpu_usage() as f64;
    let cpu_usage = if cpu_raw.is_finite() { cpu_raw.clamp(0.0, 100.0) } else { 0.0 };

    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        (app.system.used_memory() as f64 / total_memory as f64 * 100.0).clamp(0.0, 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);

    // Scratch disk turns red once free space drops under the admission threshold
    let (percent, label, color) = match app.disk {
        Some(usage) => {
            let color = if usage.available < app.threshold_bytes { Color::Red } else { Color::Magenta };
            (
                usage.used_percent(),
                format!("{} free", format_size(usage.available, DECIMAL)),
                color,
            )
        }
        None => (0.0, "unknown".to_string(), Color::DarkGray),
    };
    let disk_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Scratch"))
        .gauge_style(Style::default().fg(color))
        .percent(percent as u16)
        .label(label);
    f.render_widget(disk_gauge, chunks[2]);
}

fn state_label(state: JobState) -> (&'static str, Color) {
    match state {
        JobState::Queued => ("QUEUE", Color::Gray),
        JobState::Downloading => ("DL", Color::Cyan),
        JobState::Converting => ("CONV", Color::Yellow),
        JobState::Completed => ("OK", Color::Green),
        JobState::Failed => ("FAIL", Color::Red),
    }
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let header = Row::new(vec!["ST", "ID", "FMT", "SIZE", "AGE", "PARTS", "MESSAGE"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let now = Utc::now();
    let rows: Vec<Row> = if app.jobs.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "No jobs".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            format!("Store: {}", app.store.path().display()),
        ])]
    } else {
        app.jobs
            .iter()
            .map(|job| {
                let (label, color) = state_label(job.state);
                let size = job
                    .output_descriptor
                    .as_ref()
                    .map(|d| format_size(d.size_bytes, DECIMAL))
                    .unwrap_or_else(|| "-".to_string());
                let age = format_age(now - job.created_at);
                let parts = if job.parts.is_empty() { "-".to_string() } else { job.parts.len().to_string() };
                let message = job.error_message.as_deref().unwrap_or(&job.progress_message);

                Row::new(vec![
                    label.to_string(),
                    job.id.clone(),
                    job.output_format.extension().to_string(),
                    size,
                    age,
                    parts,
                    truncate_string(message, 80),
                ])
                .style(Style::default().fg(color))
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Length(12),
        Constraint::Length(4),
        Constraint::Length(9),
        Constraint::Length(6),
        Constraint::Length(5),
        Constraint::Min(20),
    ];

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(format!("Jobs ({})", app.jobs.len())))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let status_text = format!(
        "Total: {} | Queued: {} | Downloading: {} | Converting: {} | Completed: {} | Failed: {} | Dir: {} | q=quit",
        app.jobs.len(),
        app.count_by_state(JobState::Queued),
        app.count_by_state(JobState::Downloading),
        app.count_by_state(JobState::Converting),
        app.count_by_state(JobState::Completed),
        app.count_by_state(JobState::Failed),
        truncate_string(&app.scratch_dir.display().to_string(), 35)
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn format_age(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3600)
    }
}

fn truncate_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
