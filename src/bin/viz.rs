/// fcsim viewer: run a diagnostic simulation on the software device and
/// browse the result in a TUI.
///
///   cargo run --bin viz -- [--program program.cl] [run.json]
///
/// The simulation runs on a background thread; the screen redraws every
/// 200ms while it works:
///
///     ┌ header: device / grid / status ────────────────────────────┐
///     │ arrival-time histogram (all groups) │ Stats: occupancy, … │
///     │ diagnostics: name : value in columns                       │
///     │ q/esc: quit  r: rerun with next seed                       │
///
/// Nothing is written to disk.
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use fcsim::kernel::NdRange;
use fcsim::occupancy::{self, GroupResources};
use fcsim::software::software_limits;
use fcsim::{ResultSet, RunMode, RunParameters, Simulation, SimulationConfig, SoftwareDevice};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Sparkline},
};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::{io, thread, time::Duration};

enum Status {
    Running,
    Done(ResultSet),
    Failed(String),
}

struct App {
    params: RunParameters,
    config: SimulationConfig,
    status: Status,
    rx: Option<Receiver<Result<ResultSet, String>>>,
}

impl App {
    fn start(&mut self) {
        let (tx, rx) = mpsc::channel();
        let params = self.params.clone();
        let config = self.config.clone();
        thread::spawn(move || {
            let outcome = Simulation::init(SoftwareDevice::new(), config)
                .and_then(|sim| sim.run(&params))
                .map_err(|e| e.to_string());
            // the receiver is gone once the viewer quits
            let _ = tx.send(outcome);
        });
        self.status = Status::Running;
        self.rx = Some(rx);
    }

    fn poll(&mut self) {
        let Some(rx) = &self.rx else { return };
        match rx.try_recv() {
            Ok(Ok(results)) => self.status = Status::Done(results),
            Ok(Err(msg)) => self.status = Status::Failed(msg),
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => {
                self.status = Status::Failed("simulation thread exited".to_string())
            }
        }
        self.rx = None;
    }
}

fn parse_args() -> Result<App, Box<dyn std::error::Error>> {
    let mut params = RunParameters::default()
        .with_total_droplets(64)
        .with_grid(4, 16)
        .with_end_time(1.0)
        .with_photon_rate(1.0e4)
        .with_local_capacity(256);
    let mut config = SimulationConfig::default().with_mode(RunMode::Diagnostic);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-p" | "--program" => {
                i += 1;
                let path = args.get(i).ok_or("missing argument for --program")?;
                config = config.with_program_path(PathBuf::from(path));
            }
            path => params = RunParameters::from_json_file(path)?,
        }
        i += 1;
    }
    Ok(App {
        params,
        config,
        status: Status::Running,
        rx: None,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut app = parse_args()?;
    app.start();

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        app.poll();
        terminal.draw(|f| render(f, app))?;

        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => break,
                    KeyCode::Char('r') if app.rx.is_none() => {
                        app.config.seed = app.config.seed.wrapping_add(1);
                        app.start();
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level layout
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, app: &App) {
    let area = f.area();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),  // header
            Constraint::Min(8),     // histogram + stats
            Constraint::Length(10), // diagnostics
            Constraint::Length(1),  // footer
        ])
        .split(area);

    render_header(f, rows[0], app);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(rows[1]);

    render_histogram(f, cols[0], app);
    render_stats(f, cols[1], app);
    render_diagnostics(f, rows[2], app);
    render_footer(f, rows[3]);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .title(Span::styled(
            " fcsim viewer ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (status, status_color) = match &app.status {
        Status::Running => ("running", Color::Green),
        Status::Done(_) => ("complete", Color::Cyan),
        Status::Failed(_) => ("failed", Color::Red),
    };
    let p = &app.params;
    let spans = vec![
        Span::styled("  droplets: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            p.total_droplets.to_string(),
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        ),
        Span::styled("   grid: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            format!("{} x {}", p.workgroups, p.workitems),
            Style::default().fg(Color::Cyan),
        ),
        Span::styled("   seed: ", Style::default().fg(Color::DarkGray)),
        Span::raw(app.config.seed.to_string()),
        Span::styled("   status: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.to_uppercase(),
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
    ];
    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Sum adjacent bins so the histogram fits `width` columns.
fn downsample(bins: &[u64], width: usize) -> Vec<u64> {
    if bins.is_empty() || width == 0 {
        return Vec::new();
    }
    let per_column = bins.len().div_ceil(width);
    bins.chunks(per_column).map(|c| c.iter().sum()).collect()
}

fn render_histogram(f: &mut Frame, area: Rect, app: &App) {
    let bins = app.params.global_buffer_size_per_workgroup as usize;
    let block = Block::default()
        .title(format!(" Photon arrivals ({bins} bins, all groups) "))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    match &app.status {
        Status::Done(results) => {
            let data = downsample(&results.aggregate(bins), inner.width as usize);
            let spark = Sparkline::default()
                .data(&data)
                .style(Style::default().fg(Color::Green));
            f.render_widget(spark, inner);
        }
        Status::Running => {
            let msg = Paragraph::new(Span::styled(
                "  Simulating…",
                Style::default().fg(Color::DarkGray),
            ));
            f.render_widget(msg, inner);
        }
        Status::Failed(msg) => {
            let msg = Paragraph::new(Span::styled(
                format!("  {msg}"),
                Style::default().fg(Color::Red),
            ));
            f.render_widget(msg, inner);
        }
    }
}

// ---------------------------------------------------------------------------
// Stats panel
// ---------------------------------------------------------------------------

fn render_stats(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default().title(" Stats ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // occupancy gauge
            Constraint::Length(1), // spacer
            Constraint::Min(0),    // text stats
        ])
        .split(inner);

    let p = &app.params;
    let limits = software_limits();
    let group = GroupResources {
        work_items: p.workitems as u64,
        local_bytes: p.workitems as u64 * p.local_buffer_size_per_workitem as u64 * 4,
    };
    let occ = occupancy::occupancy(&group, &limits);
    let (_, limiter) = occupancy::max_groups_per_unit(&group, &limits);
    let occ_pct = (occ * 100.0).clamp(0.0, 100.0) as u16;
    let occ_color = match occ_pct {
        0..=33 => Color::Red,
        34..=66 => Color::Yellow,
        _ => Color::Green,
    };
    let occ_gauge = Gauge::default()
        .block(Block::default().title("Occupancy"))
        .gauge_style(Style::default().fg(occ_color))
        .percent(occ_pct)
        .label(format!("{:.1}%", occ * 100.0));
    f.render_widget(occ_gauge, rows[0]);

    let label = |s: &'static str| Span::styled(s, Style::default().fg(Color::DarkGray));
    let global = NdRange::linear(p.workgroups, p.workitems)
        .map(|r| r.global_size().to_string())
        .unwrap_or_else(|e| e.to_string());
    let mut text = vec![
        Line::from(vec![
            label("Limiter:  "),
            Span::styled(limiter.to_string(), Style::default().fg(Color::Yellow)),
        ]),
        Line::from(vec![label("Global:   "), Span::raw(global)]),
        Line::from(vec![label("End time: "), Span::raw(format!("{} s", p.end_time))]),
        Line::raw(""),
    ];
    if let Status::Done(results) = &app.status {
        text.push(Line::from(vec![
            label("Photons:  "),
            Span::raw(results.total_counts().to_string()),
        ]));
        text.push(Line::from(vec![
            label("Results:  "),
            Span::raw(results.result_len.to_string()),
        ]));
        if let Some(ns) = results.device_elapsed_ns {
            text.push(Line::from(vec![
                label("GPU:      "),
                Span::raw(format!("{:.3} ms", ns as f64 / 1e6)),
            ]));
        }
        if let Some(ns) = results.host_elapsed_ns {
            text.push(Line::from(vec![
                label("CPU:      "),
                Span::raw(format!("{:.3} ms", ns as f64 / 1e6)),
            ]));
        }
    }
    f.render_widget(Paragraph::new(text), rows[2]);
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

fn render_diagnostics(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default().title(" Diagnostics ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Status::Done(results) = &app.status else {
        return;
    };
    let Some(diag) = &results.diagnostics else {
        return;
    };

    let entries: Vec<(String, f32)> = diag.labeled().collect();
    let per_column = (inner.height as usize).max(1);
    let columns = entries.len().div_ceil(per_column);
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(vec![Constraint::Ratio(1, columns as u32); columns])
        .split(inner);

    for (col, chunk) in cols.iter().zip(entries.chunks(per_column)) {
        let lines: Vec<Line> = chunk
            .iter()
            .map(|(name, value)| {
                Line::from(vec![
                    Span::styled(format!("{name} : "), Style::default().fg(Color::DarkGray)),
                    Span::raw(format!("{value:6.4}")),
                ])
            })
            .collect();
        f.render_widget(Paragraph::new(lines), *col);
    }
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

fn render_footer(f: &mut Frame, area: Rect) {
    let text = Paragraph::new(Span::styled(
        "  q / esc: quit    r: rerun with the next seed    software device, diagnostic mode",
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_preserves_total() {
        let bins: Vec<u64> = (0..1000).collect();
        let columns = downsample(&bins, 80);
        assert!(columns.len() <= 80);
        assert_eq!(columns.iter().sum::<u64>(), bins.iter().sum::<u64>());
        assert!(downsample(&[], 10).is_empty());
    }
}
