//! Upload-analyze pipeline.
//!
//! Owns the selected image, the in-flight flag and the result text. An
//! analysis runs in three phases so the owner can keep handling events while
//! the request is out: [`Pipeline::begin_analysis`] takes the guard and
//! snapshots the selection, [`PendingAnalysis::run`] does the I/O without
//! touching the pipeline, and [`Pipeline::complete`] releases the guard and
//! applies the result if it still belongs to the current selection.

use crate::{
    config::Config,
    image::{self, PreviewRegistry, SelectedImage},
    llm::{interpret, AnalysisRequest, AnalysisResult, Dispatcher, RawResponse},
};
use chrono::{DateTime, Local};
use std::path::PathBuf;
use uuid::Uuid;

pub const LABEL_READY: &str = "Bild analysieren";
pub const LABEL_IN_PROGRESS: &str = "Analyse läuft...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    ImageSelected,
    Analyzing,
    Completed(CompletionKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Answer,
    Error,
}

pub struct Pipeline {
    config: Config,
    previews: PreviewRegistry,
    selected: Option<SelectedImage>,
    result: Option<AnalysisResult>,
    result_text: String,
    is_analyzing: bool,
    completed_at: Option<DateTime<Local>>,
}

/// Everything an analysis needs, detached from the pipeline.
#[derive(Debug)]
pub struct PendingAnalysis {
    selection: Uuid,
    path: PathBuf,
    config: Config,
}

/// Outcome of a [`PendingAnalysis`], tagged with the selection it ran against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub selection: Uuid,
    pub result: AnalysisResult,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            previews: PreviewRegistry::new(),
            selected: None,
            result: None,
            result_text: String::new(),
            is_analyzing: false,
            completed_at: None,
        }
    }

    /// `None` is a cancelled picker and leaves everything untouched.
    pub fn select_image(&mut self, file: Option<PathBuf>) {
        let Some(path) = file else {
            tracing::debug!("File selection cancelled");
            return;
        };

        // Replacing the old selection drops its preview handle.
        let selected = SelectedImage::new(path, &self.previews);
        tracing::info!(
            path = %selected.path().display(),
            preview = selected.preview_uri(),
            "Image selected"
        );
        self.selected = Some(selected);
        self.result = None;
        self.result_text.clear();
        self.completed_at = None;
    }

    /// Take the in-flight guard. Returns `None` (and changes nothing) when no
    /// image is selected or an analysis is already running.
    pub fn begin_analysis(&mut self) -> Option<PendingAnalysis> {
        let Some(selected) = self.selected.as_ref() else {
            tracing::debug!("Analyze ignored: no image selected");
            return None;
        };
        if self.is_analyzing {
            tracing::debug!("Analyze ignored: analysis already in flight");
            return None;
        }

        self.is_analyzing = true;
        Some(PendingAnalysis {
            selection: selected.id(),
            path: selected.path().to_path_buf(),
            config: self.config.clone(),
        })
    }

    /// Release the guard and apply the result. Returns false when the
    /// completion was for a selection that has since been replaced.
    pub fn complete(&mut self, completion: Completion) -> bool {
        self.is_analyzing = false;

        let current = self.selected.as_ref().map(SelectedImage::id);
        if current != Some(completion.selection) {
            tracing::info!(
                selection = %completion.selection,
                "Discarding result for a replaced image"
            );
            return false;
        }

        self.result_text = completion.result.display_text();
        self.result = Some(completion.result);
        self.completed_at = Some(Local::now());
        true
    }

    /// Run a whole analysis in place. No-op under the same conditions as
    /// [`Pipeline::begin_analysis`].
    pub async fn analyze<D: Dispatcher>(&mut self, dispatcher: &D) {
        if let Some(pending) = self.begin_analysis() {
            let completion = pending.run(dispatcher).await;
            self.complete(completion);
        }
    }

    pub fn state(&self) -> PipelineState {
        if self.is_analyzing {
            return PipelineState::Analyzing;
        }
        match (&self.selected, &self.result) {
            (None, _) => PipelineState::Idle,
            (Some(_), None) => PipelineState::ImageSelected,
            (Some(_), Some(result)) if result.is_error() => {
                PipelineState::Completed(CompletionKind::Error)
            }
            (Some(_), Some(_)) => PipelineState::Completed(CompletionKind::Answer),
        }
    }

    pub fn can_analyze(&self) -> bool {
        self.selected.is_some() && !self.is_analyzing
    }

    pub fn action_label(&self) -> &'static str {
        if self.is_analyzing {
            LABEL_IN_PROGRESS
        } else {
            LABEL_READY
        }
    }

    pub fn is_analyzing(&self) -> bool {
        self.is_analyzing
    }

    pub fn result_text(&self) -> &str {
        &self.result_text
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        self.result.as_ref()
    }

    pub fn selected(&self) -> Option<&SelectedImage> {
        self.selected.as_ref()
    }

    pub fn preview_uri(&self) -> Option<&str> {
        self.selected.as_ref().map(SelectedImage::preview_uri)
    }

    pub fn completed_at(&self) -> Option<DateTime<Local>> {
        self.completed_at
    }

    pub fn previews(&self) -> &PreviewRegistry {
        &self.previews
    }
}

impl PendingAnalysis {
    pub fn selection(&self) -> Uuid {
        self.selection
    }

    /// Encode, dispatch and interpret. Never fails: every problem becomes an
    /// [`AnalysisResult`] so the caller can always release the guard.
    pub async fn run<D: Dispatcher>(self, dispatcher: &D) -> Completion {
        let result = match self.exchange(dispatcher).await {
            Ok(response) => interpret(&response),
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "Analysis request failed");
                AnalysisResult::TransportError(format!("{:#}", e))
            }
        };

        Completion {
            selection: self.selection,
            result,
        }
    }

    async fn exchange<D: Dispatcher>(&self, dispatcher: &D) -> crate::Result<RawResponse> {
        let payload = image::read_base64(&self.path).await?;
        let request = AnalysisRequest::new(&self.config, &payload);
        dispatcher.dispatch(&request).await
    }
}
