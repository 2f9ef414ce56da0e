use std::{io::stdout, sync::mpsc, thread, time::Duration};

use crate::{
    control_loop::{ControlLoop, StepReport},
    detector::MarkerId,
    gui::error::GazeGuiError,
};

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use log::warn;
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// Requests from the dashboard to the loop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Stop,
    Calibrate,
    Threshold(i64),
    Window(i64),
    Offset(i32, i32),
}

/// Everything the dashboard shows, as of the last step.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    report: StepReport,
    threshold: usize,
    window: usize,
    offset: (i32, i32),
}

enum ThreadMessage {
    Step(Box<Snapshot>),
    Ended,
}

fn command_for(key: KeyCode) -> Option<Command> {
    match key {
        KeyCode::Char('q') | KeyCode::Esc => Some(Command::Stop),
        KeyCode::Char('c') => Some(Command::Calibrate),
        KeyCode::Char('+') | KeyCode::Char('=') => Some(Command::Threshold(1)),
        KeyCode::Char('-') => Some(Command::Threshold(-1)),
        KeyCode::Char(']') => Some(Command::Window(1)),
        KeyCode::Char('[') => Some(Command::Window(-1)),
        KeyCode::Left => Some(Command::Offset(1, 0)),
        KeyCode::Right => Some(Command::Offset(-1, 0)),
        KeyCode::Up => Some(Command::Offset(0, 1)),
        KeyCode::Down => Some(Command::Offset(0, -1)),
        _ => None,
    }
}

fn nudge(value: usize, delta: i64) -> usize {
    (value as i64 + delta).max(1) as usize
}

fn apply(control: &mut ControlLoop, command: Command) {
    match command {
        Command::Stop => {}
        Command::Calibrate => {
            if let Err(e) = control.start_calibration() {
                warn!("Dashboard : could not start calibration: {}", e);
            }
        }
        Command::Threshold(delta) => control.set_threshold(nudge(control.threshold(), delta)),
        Command::Window(delta) => control.set_window(nudge(control.window(), delta)),
        Command::Offset(dx, dy) => {
            let (x, y) = control.gaze_offset();
            control.set_gaze_offset((x + dx, y + dy));
        }
    }
}

fn show(id: Option<MarkerId>) -> String {
    id.map_or_else(|| "-".to_string(), |id| id.to_string())
}

fn render_lines(snapshot: &Snapshot) -> Vec<Line<'static>> {
    let r = &snapshot.report;
    let gaze = match (r.gaze, r.gaze_px) {
        (Some(g), Some((x, y))) => format!(
            "({:.3}, {:.3}) at ts {} -> pixel ({}, {})",
            g.x, g.y, g.ts, x, y
        ),
        _ => "waiting for gaze".to_string(),
    };
    let calibration = r
        .calibration
        .map_or_else(|| "not available".to_string(), |s| s.to_string());

    vec![
        Line::from(vec![
            " Frame       ".magenta().bold(),
            format!("{:.0} ms, {} telemetry packets", r.frame_pts_ms, r.packets).into(),
        ]),
        Line::from(vec![" Gaze        ".magenta().bold(), gaze.into()]),
        Line::from(vec![
            " Markers     ".magenta().bold(),
            format!("{} seen, looking at {}, ", r.markers, show(r.candidate)).into(),
            Span::raw(format!("ratified {}", show(r.ratified))).bold(),
        ]),
        Line::from(vec![
            " Dwell       ".magenta().bold(),
            format!(
                "threshold {} of {} frames, offset ({}, {})",
                snapshot.threshold, snapshot.window, snapshot.offset.0, snapshot.offset.1
            )
            .into(),
        ]),
        Line::from(vec![
            " Sync        ".magenta().bold(),
            format!(
                "{} samples and {} markers pending, {} matched, {} video ahead, {} evicted",
                r.sync.pending_samples,
                r.sync.pending_markers,
                r.sync.matched,
                r.sync.video_ahead,
                r.sync.evicted_stale
            )
            .into(),
        ]),
        Line::from(vec![
            " Video       ".magenta().bold(),
            format!(
                "{} decoded, {} delivered, {} dropped",
                r.frames.decoded, r.frames.delivered, r.frames.dropped
            )
            .into(),
        ]),
        Line::from(vec![" Calibration ".magenta().bold(), calibration.into()]),
    ]
}

/// Run `control` on its own thread and show what it is doing until the
/// user quits or the video ends. Hands the loop back so the caller can shut
/// it down.
pub fn dashboard(control: ControlLoop) -> Result<ControlLoop, GazeGuiError> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
    let (msg_tx, msg_rx) = mpsc::channel::<ThreadMessage>();
    let stopper = control.stopper();

    let th = thread::spawn(move || {
        let mut control = control;
        loop {
            let mut stop = false;
            for command in cmd_rx.try_iter() {
                stop |= command == Command::Stop;
                apply(&mut control, command);
            }
            if stop {
                break;
            }

            let Some(report) = control.step() else {
                let _ = msg_tx.send(ThreadMessage::Ended);
                break;
            };
            let snapshot = Snapshot {
                report,
                threshold: control.threshold(),
                window: control.window(),
                offset: control.gaze_offset(),
            };
            if msg_tx.send(ThreadMessage::Step(Box::new(snapshot))).is_err() {
                break;
            }
        }
        control
    });

    let res = draw_until_quit(&mut terminal, &cmd_tx, &msg_rx);

    // the loop thread may already be gone, in which case this is moot
    let _ = cmd_tx.send(Command::Stop);
    // and it may be stuck waiting on a frame
    stopper.stop();
    drop(msg_rx);
    let control = th.join().map_err(|_| GazeGuiError::JoinError);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    res?;
    control
}

fn draw_until_quit(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    cmd_tx: &mpsc::Sender<Command>,
    msg_rx: &mpsc::Receiver<ThreadMessage>,
) -> Result<(), GazeGuiError> {
    let mut snapshot = Snapshot::default();
    let mut ended = false;
    loop {
        for msg in msg_rx.try_iter() {
            match msg {
                ThreadMessage::Step(s) => snapshot = *s,
                ThreadMessage::Ended => ended = true,
            }
        }

        let title = if ended {
            Title::from(" Video stream ended, press q ".red().bold())
        } else {
            Title::from(" Gaze Control ".magenta().bold())
        };
        let instructions = Title::from(Line::from(vec![
            " Quit ".into(),
            "<Q>".magenta().bold(),
            " Calibrate ".into(),
            "<C>".magenta().bold(),
            " Threshold ".into(),
            "<+>/<->".magenta().bold(),
            " Window ".into(),
            "<[>/<]>".magenta().bold(),
            " Offset ".into(),
            "<Arrows> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let text = Paragraph::new(render_lines(&snapshot)).block(block);
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_widget(text, area);
        })?;

        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match command_for(key.code) {
                        Some(Command::Stop) => return Ok(()),
                        // nobody left to listen once the video has ended
                        Some(command) if !ended => cmd_tx.send(command)?,
                        _ => {}
                    }
                }
            }
        }
    }
}
