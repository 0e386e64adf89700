//! TUI dashboard for Health Thermometer discovery and monitoring
//!
//! Run with: cargo run --example thermometer_dashboard
//!
//! This example provides a terminal interface for:
//! - Watching thermometer sightings as they are refreshed
//! - Connecting to one thermometer at a time
//! - Live characteristic values with replay of the last known reading
//! - Changing the measurement interval
//! - Debugging connection phases and scan failures
//!
//! ## Keyboard Controls
//!
//! | Key | Action |
//! |-----|--------|
//! | `Up/Down` | Navigate thermometer list |
//! | `Enter` | Connect to selected thermometer |
//! | `D` | Disconnect, or cancel a pending connect |
//! | `I` | Cycle measurement interval (1s, 5s, 30s) |
//! | `S` | Start/stop scanning |
//! | `U` | Toggle temperature units |
//! | `Q/Esc` | Quit |

use health_thermometer_ble::{
    celsius_to_fahrenheit, ConnectionEvent, ConnectionPhase, DeviceManager, Error, GateStatus,
    PeripheralSighting, Result, ScanEvent, TemperatureMeasurement, INTERMEDIATE_TEMPERATURE,
    MEASUREMENT_INTERVAL, TEMPERATURE_MEASUREMENT,
};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    prelude::*,
    widgets::{block::Title, *},
};
use std::io::{self, stdout, Stdout};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

const INTERVAL_CHOICES: [u64; 3] = [1, 5, 30];
const TYPED_REFRESH: Duration = Duration::from_secs(2);

/// Binary characteristics read through the typed session helpers.
enum TypedReading {
    Measurement(TemperatureMeasurement),
    Interval(Duration),
}

/// Temperature unit preference
#[derive(Clone, Copy, PartialEq, Eq)]
enum DisplayUnit {
    Celsius,
    Fahrenheit,
}

impl DisplayUnit {
    fn format(&self, celsius: f64) -> String {
        match self {
            DisplayUnit::Celsius => format!("{:.1}°C", celsius),
            DisplayUnit::Fahrenheit => format!("{:.1}°F", celsius_to_fahrenheit(celsius)),
        }
    }
}

/// Log severity level
#[derive(Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn style(&self) -> Style {
        match self {
            LogLevel::Info => Style::default().fg(Color::Cyan),
            LogLevel::Warn => Style::default().fg(Color::Yellow),
            LogLevel::Error => Style::default().fg(Color::Red),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Event log entry
struct LogEntry {
    timestamp: Instant,
    level: LogLevel,
    message: String,
}

/// Main application state
struct App {
    device_manager: Arc<DeviceManager>,
    sightings: Vec<PeripheralSighting>,
    selected_index: usize,
    unit: DisplayUnit,
    interval_choice: usize,
    scan_events: broadcast::Receiver<ScanEvent>,
    connection_events: broadcast::Receiver<ConnectionEvent>,
    /// Results of background connect and write tasks.
    task_results: mpsc::UnboundedReceiver<(LogLevel, String)>,
    task_tx: mpsc::UnboundedSender<(LogLevel, String)>,
    typed_results: mpsc::UnboundedReceiver<TypedReading>,
    typed_tx: mpsc::UnboundedSender<TypedReading>,
    measurement: Option<TemperatureMeasurement>,
    interval: Option<Duration>,
    last_typed_refresh: Option<Instant>,
    event_log: Vec<LogEntry>,
    max_log_entries: usize,
    start_time: Instant,
}

impl App {
    async fn new() -> Result<Self> {
        let device_manager = Arc::new(DeviceManager::new().await?);
        let scan_events = device_manager.subscribe_sightings();
        let connection_events = device_manager.subscribe_connection_events();
        let (task_tx, task_results) = mpsc::unbounded_channel();
        let (typed_tx, typed_results) = mpsc::unbounded_channel();

        Ok(Self {
            device_manager,
            sightings: Vec::new(),
            selected_index: 0,
            unit: DisplayUnit::Celsius,
            interval_choice: 0,
            scan_events,
            connection_events,
            task_results,
            task_tx,
            typed_results,
            typed_tx,
            measurement: None,
            interval: None,
            last_typed_refresh: None,
            event_log: Vec::new(),
            max_log_entries: 100,
            start_time: Instant::now(),
        })
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.event_log.push(LogEntry {
            timestamp: Instant::now(),
            level,
            message: message.into(),
        });

        // Trim old entries
        if self.event_log.len() > self.max_log_entries {
            self.event_log.remove(0);
        }
    }

    fn selected(&self) -> Option<&PeripheralSighting> {
        self.sightings.get(self.selected_index)
    }

    async fn toggle_scanning(&mut self) {
        let result = if self.device_manager.is_scanning() {
            self.device_manager.stop_scanning().await.map(|_| "Stopped scanning")
        } else {
            self.device_manager.start_scanning().await.map(|_| "Started scanning")
        };
        match result {
            Ok(message) => self.log(LogLevel::Info, message),
            Err(e) => self.log(LogLevel::Error, format!("Scan toggle failed: {}", e)),
        }
    }

    fn connect_selected(&mut self) {
        let Some(sighting) = self.selected().cloned() else {
            return;
        };

        self.log(
            LogLevel::Info,
            format!("Connecting to {} ({})", sighting.display_name, sighting.id),
        );

        let manager = self.device_manager.clone();
        let tx = self.task_tx.clone();
        tokio::spawn(async move {
            let outcome = match manager.connect(&sighting.id).await {
                Ok(_) => (LogLevel::Info, format!("Session ready for {}", sighting.display_name)),
                Err(Error::ConnectionCancelled { .. }) => (LogLevel::Warn, "Connect cancelled".to_string()),
                Err(e) => (LogLevel::Error, format!("Connect failed: {}", e)),
            };
            let _ = tx.send(outcome);
        });
    }

    async fn disconnect(&mut self) {
        match self.device_manager.disconnect().await {
            Ok(()) => self.log(LogLevel::Info, "Disconnect requested"),
            Err(e) => self.log(LogLevel::Error, format!("Disconnect failed: {}", e)),
        }
    }

    fn cycle_interval(&mut self) {
        let Some(session) = self.device_manager.session() else {
            self.log(LogLevel::Warn, "Not connected");
            return;
        };

        self.interval_choice = (self.interval_choice + 1) % INTERVAL_CHOICES.len();
        let interval = Duration::from_secs(INTERVAL_CHOICES[self.interval_choice]);
        let tx = self.task_tx.clone();
        tokio::spawn(async move {
            let outcome = match session.write_measurement_interval(interval).await {
                Ok(()) => (LogLevel::Info, format!("Measurement interval set to {:?}", interval)),
                Err(e) => (LogLevel::Error, format!("Interval write failed: {}", e)),
            };
            let _ = tx.send(outcome);
        });
    }

    /// Drain pending events into the log and refresh the sighting list.
    fn update(&mut self) {
        loop {
            match self.scan_events.try_recv() {
                Ok(ScanEvent::Sighting(sighting)) => {
                    if !self.sightings.iter().any(|s| s.id == sighting.id) {
                        self.log(
                            LogLevel::Info,
                            format!("Discovered {} ({})", sighting.display_name, sighting.id),
                        );
                    }
                }
                Ok(ScanEvent::Failed(e)) => self.log(LogLevel::Error, format!("Scan failed: {}", e)),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.log(LogLevel::Warn, format!("Dropped {} scan events", n))
                }
                Err(_) => break,
            }
        }

        loop {
            match self.connection_events.try_recv() {
                Ok(event) => {
                    let level = match event.phase {
                        ConnectionPhase::Failed(_) => LogLevel::Error,
                        ConnectionPhase::Disconnected => LogLevel::Warn,
                        _ => LogLevel::Info,
                    };
                    self.log(level, format!("{}: {}", event.peripheral, event.phase));
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }

        while let Ok((level, message)) = self.task_results.try_recv() {
            self.log(level, message);
        }

        self.refresh_typed();

        self.sightings = self.device_manager.sightings_by_signal();
        if self.selected_index >= self.sightings.len() {
            self.selected_index = self.sightings.len().saturating_sub(1);
        }
    }
}

impl App {
    /// Periodically re-read the binary characteristics while connected.
    fn refresh_typed(&mut self) {
        while let Ok(reading) = self.typed_results.try_recv() {
            match reading {
                TypedReading::Measurement(measurement) => self.measurement = Some(measurement),
                TypedReading::Interval(interval) => self.interval = Some(interval),
            }
        }

        let Some(session) = self.device_manager.session() else {
            self.measurement = None;
            self.interval = None;
            self.last_typed_refresh = None;
            return;
        };
        if self
            .last_typed_refresh
            .map_or(false, |at| at.elapsed() < TYPED_REFRESH)
        {
            return;
        }
        self.last_typed_refresh = Some(Instant::now());

        let characteristics = session.characteristics();
        let tx = self.typed_tx.clone();
        tokio::spawn(async move {
            if characteristics.contains(&TEMPERATURE_MEASUREMENT) {
                if let Ok(measurement) = session.read_temperature_measurement().await {
                    let _ = tx.send(TypedReading::Measurement(measurement));
                }
            }
            if characteristics.contains(&MEASUREMENT_INTERVAL) {
                if let Ok(interval) = session.read_measurement_interval().await {
                    let _ = tx.send(TypedReading::Interval(interval));
                }
            }
        });
    }
}

/// Main terminal type alias
type Terminal = ratatui::Terminal<CrosstermBackend<Stdout>>;

fn setup_terminal() -> io::Result<Terminal> {
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Terminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()
}

fn render_ui(frame: &mut Frame, app: &App) {
    let size = frame.area();

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),  // Header
            Constraint::Min(10),    // Content
            Constraint::Length(10), // Event log
            Constraint::Length(1),  // Status bar
        ])
        .split(size);

    render_header(frame, main_chunks[0], app);
    render_content(frame, main_chunks[1], app);
    render_event_log(frame, main_chunks[2], app);
    render_status_bar(frame, main_chunks[3], app);
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let elapsed = app.start_time.elapsed();
    let title = format!(
        " HEALTH THERMOMETER DASHBOARD | Seen: {} | Uptime: {:02}:{:02}:{:02} ",
        app.sightings.len(),
        elapsed.as_secs() / 3600,
        (elapsed.as_secs() % 3600) / 60,
        elapsed.as_secs() % 60
    );

    let header = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(Title::from(title).alignment(Alignment::Center))
        .title(
            Title::from(" [Q] Quit ")
                .alignment(Alignment::Right)
                .position(block::Position::Top),
        );

    frame.render_widget(header, area);
}

fn render_content(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    render_sighting_list(frame, chunks[0], app);
    render_session(frame, chunks[1], app);
}

fn render_sighting_list(frame: &mut Frame, area: Rect, app: &App) {
    let connected = app.device_manager.connection();

    let items: Vec<ListItem> = app
        .sightings
        .iter()
        .enumerate()
        .map(|(i, sighting)| {
            let phase = connected
                .as_ref()
                .filter(|c| c.peripheral == sighting.id)
                .map(|c| c.phase.clone());
            let icon = if phase.is_some() { "●" } else { "○" };

            let style = if i == app.selected_index {
                Style::default().bg(Color::DarkGray).fg(Color::White)
            } else if phase.as_ref().is_some_and(ConnectionPhase::is_ready) {
                Style::default().fg(Color::Green)
            } else {
                Style::default()
            };

            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", icon), style),
                Span::styled(format!("{:<20} ", sighting.display_name), style),
                Span::styled(
                    format!(
                        "{:>5} dBm ",
                        sighting.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".into())
                    ),
                    style,
                ),
                Span::styled(sighting.last_seen_at.format("%H:%M:%S").to_string(), style),
            ]))
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Thermometers ")
            .title(
                Title::from(if app.device_manager.is_scanning() {
                    " [Scanning] "
                } else {
                    " [Stopped] "
                })
                .alignment(Alignment::Right),
            ),
    );

    frame.render_widget(list, area);
}

fn render_session(frame: &mut Frame, area: Rect, app: &App) {
    let mut lines = Vec::new();

    match app.device_manager.connection() {
        Some(connection) => {
            lines.push(Line::from(vec![
                Span::styled("Peripheral: ", Style::default().fg(Color::DarkGray)),
                Span::raw(connection.peripheral.to_string()),
            ]));
            lines.push(Line::from(vec![
                Span::styled("Phase:      ", Style::default().fg(Color::DarkGray)),
                Span::raw(connection.phase.to_string()),
            ]));
        }
        None => lines.push(Line::from(Span::styled(
            "Not connected. Select a thermometer and press Enter.",
            Style::default().fg(Color::DarkGray),
        ))),
    }

    if let Some(session) = app.device_manager.session() {
        lines.push(Line::raw(""));

        for name in session.characteristics() {
            let value = match (name, session.latest(name)) {
                (TEMPERATURE_MEASUREMENT, _) => match &app.measurement {
                    Some(measurement) => measurement
                        .celsius()
                        .map(|c| app.unit.format(c))
                        .unwrap_or_else(|| "n/a".to_string()),
                    None => "-".to_string(),
                },
                (MEASUREMENT_INTERVAL, _) => app
                    .interval
                    .map(|d| format!("{:?}", d))
                    .unwrap_or_else(|| "-".to_string()),
                (_, None) => "-".to_string(),
                (INTERMEDIATE_TEMPERATURE, Some(value)) => value
                    .as_text()
                    .and_then(|t| t.trim().parse::<f64>().ok())
                    .map(|c| app.unit.format(c))
                    .unwrap_or_else(|| value.to_string()),
                (_, Some(value)) => value.to_string(),
            };

            lines.push(Line::from(vec![
                Span::styled(format!("{:<26}", name), Style::default().fg(Color::Cyan)),
                Span::styled(value, Style::default().add_modifier(Modifier::BOLD)),
            ]));
        }
    }

    let paragraph =
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" Session "));
    frame.render_widget(paragraph, area);
}

fn render_event_log(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .event_log
        .iter()
        .rev()
        .take(area.height.saturating_sub(2) as usize)
        .map(|entry| {
            let elapsed = entry.timestamp.elapsed();
            let mins = elapsed.as_secs() / 60;
            let secs = elapsed.as_secs() % 60;

            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{:02}:{:02} ", mins, secs),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(format!("[{}] ", entry.level.label()), entry.level.style()),
                Span::raw(&entry.message),
            ]))
        })
        .collect();

    let list = List::new(items).block(Block::default().borders(Borders::ALL).title(" Event Log "));

    frame.render_widget(list, area);
}

fn render_status_bar(frame: &mut Frame, area: Rect, app: &App) {
    let gate = match app.device_manager.gate_status() {
        GateStatus::Ready => "Ready".to_string(),
        other => format!("{:?}", other),
    };
    let unit_str = match app.unit {
        DisplayUnit::Celsius => "°C",
        DisplayUnit::Fahrenheit => "°F",
    };

    let status = format!(
        " Bluetooth: {} | Unit: {} | [Enter] Connect [D] Disconnect [I] Interval [S] Scan [U] Units ",
        gate, unit_str
    );

    let paragraph =
        Paragraph::new(status).style(Style::default().bg(Color::DarkGray).fg(Color::White));

    frame.render_widget(paragraph, area);
}

async fn run_app(terminal: &mut Terminal, mut app: App) -> Result<()> {
    app.device_manager.start_scanning().await?;
    app.log(LogLevel::Info, "Started BLE scanning");

    loop {
        app.update();

        terminal
            .draw(|frame| render_ui(frame, &app))
            .map_err(|e| Error::Internal(format!("Draw error: {}", e)))?;

        // Handle input with timeout for updates
        let has_event = event::poll(Duration::from_millis(100))
            .map_err(|e| Error::Internal(format!("Poll error: {}", e)))?;

        if !has_event {
            continue;
        }

        let event = event::read().map_err(|e| Error::Internal(format!("Read error: {}", e)))?;

        if let Event::Key(key) = event {
            if key.kind != KeyEventKind::Press {
                continue;
            }

            match key.code {
                KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => break,
                KeyCode::Up => {
                    app.selected_index = app.selected_index.saturating_sub(1);
                }
                KeyCode::Down => {
                    if app.selected_index + 1 < app.sightings.len() {
                        app.selected_index += 1;
                    }
                }
                KeyCode::Enter => app.connect_selected(),
                KeyCode::Char('d') | KeyCode::Char('D') => app.disconnect().await,
                KeyCode::Char('i') | KeyCode::Char('I') => app.cycle_interval(),
                KeyCode::Char('s') | KeyCode::Char('S') => app.toggle_scanning().await,
                KeyCode::Char('u') | KeyCode::Char('U') => {
                    app.unit = match app.unit {
                        DisplayUnit::Celsius => DisplayUnit::Fahrenheit,
                        DisplayUnit::Fahrenheit => DisplayUnit::Celsius,
                    };
                }
                _ => {}
            }
        }
    }

    app.device_manager.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log to a file so tracing output doesn't interfere with the TUI
    if let Ok(file) = std::fs::File::create("thermometer_dashboard.log") {
        tracing_subscriber::fmt()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_env_filter("health_thermometer_ble=debug")
            .init();
    }

    let app = App::new().await?;

    let mut terminal = setup_terminal()
        .map_err(|e| Error::Internal(format!("Failed to setup terminal: {}", e)))?;

    let result = run_app(&mut terminal, app).await;

    let _ = restore_terminal(&mut terminal);

    result
}
