use std::{io::stdout, path::PathBuf};

use crate::gui::error::GazeGuiError;

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// What the user picked in [`device_selector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortChoice {
    Port(PathBuf),
    /// Run without an actuator; commands are only logged.
    LogOnly,
    Quit,
}

const LOG_ONLY: &str = "(no device, log commands only)";

fn choice_at(ports: &mut Vec<PathBuf>, cursor: usize) -> PortChoice {
    if cursor < ports.len() {
        PortChoice::Port(ports.swap_remove(cursor))
    } else {
        PortChoice::LogOnly
    }
}

/// Let the user pick the actuator's serial port from `available_ports`.
pub fn device_selector(mut available_ports: Vec<PathBuf>) -> Result<PortChoice, GazeGuiError> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    // the extra entry at the end is the log-only choice
    let n_entries = available_ports.len() + 1;
    let mut cursor = 0;
    let mut list_state = ListState::default().with_selected(Some(cursor));
    let mut selected = None;
    loop {
        let title = Title::from(" Actuator Port ".magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Navigate ".into(),
            "<Up>/<Down>".magenta().bold(),
            " Select ".into(),
            "<Enter>".magenta().bold(),
            " Quit ".into(),
            "<Q> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let entries = available_ports
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .chain(std::iter::once(LOG_ONLY.to_string()));
        let list = List::new(entries)
            .style(Style::default().fg(Color::White))
            .highlight_symbol(">>")
            .highlight_style(Style::default().fg(Color::Magenta))
            .block(block);
        list_state.select(Some(cursor));
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_stateful_widget(list, area, &mut list_state);
        })?;
        if event::poll(std::time::Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Down => {
                            cursor = (cursor + 1) % n_entries;
                        }
                        KeyCode::Up => {
                            cursor = (cursor + n_entries - 1) % n_entries;
                        }
                        KeyCode::Enter => {
                            selected = Some(cursor);
                            break;
                        }
                        KeyCode::Char('q') => break,
                        _ => {}
                    }
                }
            }
        }
    }

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(match selected {
        Some(i) => choice_at(&mut available_ports, i),
        None => PortChoice::Quit,
    })
}
