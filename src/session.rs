//! Interactive session: reads commands line by line and drives one
//! [`Pipeline`]. At most one analysis is in flight; its future is polled in
//! the same `select!` loop that reads input, so a new image can be picked
//! while a request is still out.

use crate::{
    llm::Dispatcher,
    pipeline::{Completion, Pipeline, PipelineState, CompletionKind},
};
use anyhow::{anyhow, Result};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

type InFlight<'a> = Pin<Box<dyn Future<Output = Completion> + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `open` without a path is a cancelled picker.
    Open(Option<PathBuf>),
    Analyze,
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_ascii_lowercase().as_str() {
            "open" | "o" => Ok(Command::Open(
                (!rest.is_empty()).then(|| PathBuf::from(rest)),
            )),
            "analyze" | "a" => Ok(Command::Analyze),
            "status" | "s" => Ok(Command::Status),
            "help" | "h" | "?" => Ok(Command::Help),
            "quit" | "q" | "exit" => Ok(Command::Quit),
            other => Err(anyhow!("Unbekannter Befehl: {}", other)),
        }
    }
}

pub struct Session<'d, D> {
    pipeline: Pipeline,
    dispatcher: &'d D,
}

impl<'d, D: Dispatcher + 'd> Session<'d, D> {
    pub fn new(pipeline: Pipeline, dispatcher: &'d D) -> Self {
        Self {
            pipeline,
            dispatcher,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run until `quit` or end of input. A pending analysis is awaited after
    /// end of input; `quit` ends the session immediately.
    pub async fn run<R, W>(&mut self, input: R, out: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();
        let mut in_flight: Option<InFlight<'d>> = None;
        let mut input_open = true;

        writeln!(out, "🏗️  Bau-KI mit Bilderkennung")?;
        write_help(out)?;

        loop {
            if !input_open && in_flight.is_none() {
                break;
            }

            tokio::select! {
                completion = wait_for(&mut in_flight) => {
                    in_flight = None;
                    if self.pipeline.complete(completion) {
                        render_result(out, &self.pipeline)?;
                    } else {
                        writeln!(out, "⚠️  Ergebnis verworfen: inzwischen wurde ein anderes Bild gewählt.")?;
                    }
                }
                line = lines.next_line(), if input_open => {
                    let Some(line) = line? else {
                        input_open = false;
                        continue;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let command = match line.parse::<Command>() {
                        Ok(command) => command,
                        Err(e) => {
                            writeln!(out, "❓ {} (\"help\" zeigt alle Befehle)", e)?;
                            continue;
                        }
                    };
                    if command == Command::Quit {
                        if in_flight.is_some() {
                            tracing::warn!("Session closed with an analysis still in flight");
                        }
                        break;
                    }
                    if let Some(pending) = self.handle(command, out)? {
                        in_flight = Some(pending);
                    }
                }
            }
        }

        writeln!(out, "👋 Auf Wiedersehen")?;
        Ok(())
    }

    fn handle<W: Write>(&mut self, command: Command, out: &mut W) -> Result<Option<InFlight<'d>>> {
        match command {
            Command::Open(file) => {
                if file.is_none() {
                    writeln!(out, "ℹ️  Keine Datei gewählt.")?;
                }
                self.pipeline.select_image(file);
                render_selection(out, &self.pipeline)?;
            }
            Command::Analyze => match self.pipeline.begin_analysis() {
                Some(pending) => {
                    writeln!(out, "⏳ {}", self.pipeline.action_label())?;
                    let analysis: InFlight<'d> = Box::pin(pending.run(self.dispatcher));
                    return Ok(Some(analysis));
                }
                None => {
                    writeln!(
                        out,
                        "🚫 [{}] ist deaktiviert: {}",
                        self.pipeline.action_label(),
                        disabled_reason(&self.pipeline)
                    )?;
                }
            },
            Command::Status => render_status(out, &self.pipeline)?,
            Command::Help => write_help(out)?,
            Command::Quit => {}
        }
        Ok(None)
    }
}

async fn wait_for(slot: &mut Option<InFlight<'_>>) -> Completion {
    match slot {
        Some(analysis) => analysis.await,
        None => std::future::pending().await,
    }
}

/// One-shot flow: select `image`, analyze it, print the result panel.
/// Output is flushed before the request goes out.
pub async fn analyze_once<D, W>(
    pipeline: &mut Pipeline,
    dispatcher: &D,
    image: PathBuf,
    out: &mut W,
) -> Result<()>
where
    D: Dispatcher,
    W: Write,
{
    pipeline.select_image(Some(image));
    render_selection(out, pipeline)?;
    let Some(pending) = pipeline.begin_analysis() else {
        return Ok(());
    };
    writeln!(out, "⏳ {}", pipeline.action_label())?;
    out.flush()?;

    let completion = pending.run(dispatcher).await;
    pipeline.complete(completion);

    render_result(out, pipeline)?;
    out.flush()?;
    Ok(())
}

fn disabled_reason(pipeline: &Pipeline) -> &'static str {
    if pipeline.is_analyzing() {
        "Analyse läuft bereits"
    } else {
        "kein Bild gewählt"
    }
}

fn write_help<W: Write>(out: &mut W) -> Result<()> {
    writeln!(out, "Befehle:")?;
    writeln!(out, "  open <pfad>   Bild auswählen")?;
    writeln!(out, "  analyze       Bild analysieren")?;
    writeln!(out, "  status        Zustand anzeigen")?;
    writeln!(out, "  quit          Beenden")?;
    Ok(())
}

pub fn render_selection<W: Write>(out: &mut W, pipeline: &Pipeline) -> Result<()> {
    if let Some(selected) = pipeline.selected() {
        writeln!(out, "🖼️  Vorschau: {}", selected.path().display())?;
        writeln!(out, "   {}", selected.preview_uri())?;
    }
    Ok(())
}

/// Print the result panel. Nothing is printed while the text is empty; the
/// text itself is written verbatim.
pub fn render_result<W: Write>(out: &mut W, pipeline: &Pipeline) -> Result<()> {
    let text = pipeline.result_text();
    if text.is_empty() {
        return Ok(());
    }
    writeln!(out, "📋 Analyseergebnis:")?;
    writeln!(out, "{}", text)?;
    Ok(())
}

pub fn render_status<W: Write>(out: &mut W, pipeline: &Pipeline) -> Result<()> {
    let state = match pipeline.state() {
        PipelineState::Idle => "kein Bild gewählt",
        PipelineState::ImageSelected => "Bild gewählt",
        PipelineState::Analyzing => "Analyse läuft",
        PipelineState::Completed(CompletionKind::Answer) => "Ergebnis liegt vor",
        PipelineState::Completed(CompletionKind::Error) => "Fehler",
    };
    writeln!(out, "📊 Zustand: {}", state)?;
    if let Some(selected) = pipeline.selected() {
        writeln!(out, "   Bild: {}", selected.path().display())?;
    }
    let enabled = if pipeline.can_analyze() { "aktiv" } else { "deaktiviert" };
    writeln!(out, "   [{}] {}", pipeline.action_label(), enabled)?;
    if let Some(at) = pipeline.completed_at() {
        writeln!(out, "   Abgeschlossen: {}", at.format("%Y-%m-%d %H:%M:%S"))?;
    }
    Ok(())
}
