mod client;
mod config;
mod controller;
mod conversation;

use anyhow::{Context, Result};
use client::{SseClient, StreamEvent};
use config::Config;
use controller::StreamController;
use conversation::Status;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use streamchat_shared::MessageRole;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const WELCOME: &str = "You can use me to create your own chat bot app. In this demo I am an \
expert in movie reviews, so feel free to ask me about Movies!";

struct App {
    chat: StreamController<SseClient>,
    input: String,
    cursor_position: usize,
    scroll_offset: usize,
}

impl App {
    fn new(chat: StreamController<SseClient>) -> Self {
        Self {
            chat,
            input: String::new(),
            cursor_position: 0,
            scroll_offset: 0,
        }
    }

    fn submit(&mut self) {
        if self.input.trim().is_empty() {
            return;
        }
        let content: String = self.input.drain(..).collect();
        self.cursor_position = 0;
        self.scroll_to_bottom();

        if let Err(e) = self.chat.send_turn(&content) {
            error!("Failed to send message: {}", e);
        }
    }

    fn move_cursor_left(&mut self) {
        if let Some(c) = self.input[..self.cursor_position].chars().next_back() {
            self.cursor_position -= c.len_utf8();
        }
    }

    fn move_cursor_right(&mut self) {
        if let Some(c) = self.input[self.cursor_position..].chars().next() {
            self.cursor_position += c.len_utf8();
        }
    }

    fn insert_char(&mut self, c: char) {
        self.input.insert(self.cursor_position, c);
        self.cursor_position += c.len_utf8();
    }

    fn delete_char(&mut self) {
        if let Some(c) = self.input[..self.cursor_position].chars().next_back() {
            self.cursor_position -= c.len_utf8();
            self.input.remove(self.cursor_position);
        }
    }

    fn scroll_up(&mut self, amount: usize) {
        self.scroll_offset = self.scroll_offset.saturating_add(amount);
    }

    fn scroll_down(&mut self, amount: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(amount);
    }

    fn scroll_to_bottom(&mut self) {
        self.scroll_offset = 0;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Log to a file so the TUI is not corrupted
    let log_file = std::fs::File::create("streamchat.log").ok();
    if let Some(file) = log_file {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| "streamchat=info".into()),
            )
            .with_writer(file)
            .with_ansi(false)
            .init();
    }

    let config = Config::from_env().context("Invalid configuration")?;
    info!(
        "Using endpoint {} (history length {})",
        config.endpoint, config.history_length
    );

    let transport = SseClient::new(&config);
    let (chat, mut stream_rx) = StreamController::new(config, transport);
    let mut app = App::new(chat);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        while let Ok(event) = event::read() {
            if ui_tx.send(event).is_err() {
                break;
            }
        }
    });

    let res = run_app(&mut terminal, &mut app, &mut stream_rx, &mut ui_rx).await;

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("{err:?}");
    }

    Ok(())
}

async fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    stream_rx: &mut mpsc::UnboundedReceiver<StreamEvent>,
    ui_rx: &mut mpsc::UnboundedReceiver<Event>,
) -> Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        tokio::select! {
            Some(event) = ui_rx.recv() => {
                match event {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        match key.code {
                            KeyCode::Char('q') | KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                                if app.chat.is_active() {
                                    app.chat.cancel();
                                }
                                return Ok(())
                            }
                            KeyCode::Char('l') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                                app.chat.clear();
                                app.scroll_to_bottom();
                            }
                            KeyCode::Esc => {
                                app.chat.cancel();
                            }
                            KeyCode::Char(c) => {
                                app.insert_char(c);
                            }
                            KeyCode::Backspace => {
                                app.delete_char();
                            }
                            KeyCode::Left => {
                                app.move_cursor_left();
                            }
                            KeyCode::Right => {
                                app.move_cursor_right();
                            }
                            KeyCode::Enter => {
                                app.submit();
                            }
                            KeyCode::Up => {
                                app.scroll_up(1);
                            }
                            KeyCode::Down => {
                                app.scroll_down(1);
                            }
                            KeyCode::PageUp => {
                                app.scroll_up(10);
                            }
                            KeyCode::PageDown => {
                                app.scroll_down(10);
                            }
                            KeyCode::Home => {
                                app.cursor_position = 0;
                            }
                            KeyCode::End => {
                                app.cursor_position = app.input.len();
                            }
                            _ => {}
                        }
                    }
                    Event::Mouse(mouse) => {
                        match mouse.kind {
                            event::MouseEventKind::ScrollUp => {
                                app.scroll_up(3);
                            }
                            event::MouseEventKind::ScrollDown => {
                                app.scroll_down(3);
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
            Some(event) = stream_rx.recv() => {
                app.chat.handle_event(event);
            }
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),  // Status line
            Constraint::Min(1),     // Chat area takes remaining space
            Constraint::Length(3),  // Input box is always 3 lines
        ])
        .split(f.area());

    render_status(f, app, chunks[0]);
    render_chat(f, app, chunks[1]);
    render_input(f, app, chunks[2]);
}

fn render_status(f: &mut Frame, app: &App, area: Rect) {
    let status = app.chat.status();
    let color = match status {
        Status::Idle => Color::Green,
        Status::Waiting => Color::Yellow,
        Status::Streaming => Color::Cyan,
    };

    let mut spans = vec![Span::styled(
        format!("● {}", status.label()),
        Style::default().fg(color),
    )];
    if let Some(model) = &app.chat.config().model {
        spans.push(Span::styled(format!("  {}", model), Style::default().fg(Color::DarkGray)));
    }
    if let Some(error) = app.chat.last_error() {
        spans.push(Span::styled(
            format!("  Error: {}", error),
            Style::default().fg(Color::Red),
        ));
    }
    if app.chat.dropped_events() > 0 {
        spans.push(Span::styled(
            format!("  ({} malformed events skipped)", app.chat.dropped_events()),
            Style::default().fg(Color::DarkGray),
        ));
    }

    f.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn role_style(role: MessageRole) -> (&'static str, Style) {
    match role {
        MessageRole::System => ("System", Style::default().fg(Color::Yellow)),
        MessageRole::User => ("You", Style::default().fg(Color::Cyan)),
        MessageRole::Assistant => ("Assistant", Style::default().fg(Color::Green)),
    }
}

fn push_message<'a>(lines: &mut Vec<Line<'a>>, role: MessageRole, content: &'a str, streaming: bool) {
    let (prefix, style) = role_style(role);
    lines.push(Line::from(Span::styled(
        format!("{}:", prefix),
        style.add_modifier(Modifier::BOLD),
    )));

    let mut content_lines: Vec<Line> = content
        .lines()
        .map(|line| Line::from(Span::styled(line, style)))
        .collect();
    if streaming {
        // Cursor shows the reply is still arriving
        match content_lines.last_mut() {
            Some(last) => last.push_span(Span::styled("▌", style)),
            None => content_lines.push(Line::from(Span::styled("▌", style))),
        }
    }
    lines.extend(content_lines);
    lines.push(Line::from(""));
}

fn render_chat(f: &mut Frame, app: &App, area: Rect) {
    let mut all_lines: Vec<Line> = Vec::new();

    if app.chat.history().is_empty() && app.chat.current_partial_message().is_none() {
        all_lines.push(Line::from(Span::styled(
            WELCOME,
            Style::default().fg(Color::Gray),
        )));
        all_lines.push(Line::from(""));
    }

    for msg in app.chat.history() {
        push_message(&mut all_lines, msg.role, &msg.content, false);
    }
    if let Some(partial) = app.chat.current_partial_message() {
        push_message(&mut all_lines, MessageRole::Assistant, partial, true);
    }

    // Calculate visible lines based on scroll offset
    let total_lines = all_lines.len();
    let visible_height = area.height as usize;

    let start_line = if total_lines > visible_height {
        let max_scroll = total_lines.saturating_sub(visible_height);
        let actual_scroll = app.scroll_offset.min(max_scroll);
        max_scroll.saturating_sub(actual_scroll)
    } else {
        0
    };

    let end_line = (start_line + visible_height).min(total_lines);
    let visible_lines: Vec<Line> = all_lines[start_line..end_line].to_vec();

    let chat = Paragraph::new(visible_lines)
        .block(Block::default().borders(Borders::NONE))
        .wrap(Wrap { trim: false });

    f.render_widget(chat, area);
}

fn render_input(f: &mut Frame, app: &App, area: Rect) {
    let input_text = if app.input.is_empty() {
        "Ask me about movies..."
    } else {
        &app.input
    };

    let style = if app.input.is_empty() {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default()
    };

    let input = Paragraph::new(input_text)
        .style(style)
        .block(Block::default()
            .borders(Borders::ALL)
            .title("Input (Enter send, Esc cancel, Ctrl-L clear, Ctrl-Q quit)")
            .border_style(Style::default().fg(Color::White)))
        .wrap(Wrap { trim: true });

    f.render_widget(input, area);

    if !app.input.is_empty() {
        let column = app.input[..app.cursor_position].chars().count() as u16;
        let cursor_x = area.x + column + 1;
        let cursor_y = area.y + 1;
        f.set_cursor_position((cursor_x.min(area.x + area.width.saturating_sub(2)), cursor_y));
    }
}
