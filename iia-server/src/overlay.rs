use iia_core::{GenerationStatus, ModelStatus, OrchestratorState};
use serde::Serialize;

const NOTIFICATION_TITLE: &str = "IIA Engine Active";

/// Geometry and visibility of the floating control surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlayState {
    pub visible: bool,
    pub expanded: bool,
    pub x: i32,
    pub y: i32,
    #[serde(skip)]
    offset: (f32, f32),
}

impl Default for OverlayState {
    fn default() -> Self {
        Self {
            visible: false,
            expanded: false,
            x: 0,
            y: 200,
            offset: (0.0, 200.0),
        }
    }
}

impl OverlayState {
    /// Returns false when the overlay was already showing.
    pub fn show(&mut self) -> bool {
        !std::mem::replace(&mut self.visible, true)
    }

    pub fn set_expanded(&mut self, expanded: bool) {
        self.expanded = expanded;
    }

    /// Applies a drag delta. Sub-pixel movement accumulates across drags.
    pub fn drag(&mut self, dx: f32, dy: f32) {
        self.offset.0 += dx;
        self.offset.1 += dy;
        self.x = self.offset.0.round() as i32;
        self.y = self.offset.1.round() as i32;
    }
}

/// Foreground notification content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: &'static str,
    pub text: &'static str,
}

impl Notification {
    pub fn for_state(state: &OrchestratorState) -> Self {
        let text = match (&state.model, &state.generation) {
            (_, GenerationStatus::Running(_)) => "Generating an image",
            (ModelStatus::Unloaded, _) => "Waiting for a model",
            (ModelStatus::Loading, _) => "Loading model",
            (ModelStatus::Ready, _) => "Stable Diffusion is ready in the background",
            (ModelStatus::LoadFailed(_), _) => "Model failed to load",
        };
        Self {
            title: NOTIFICATION_TITLE,
            text,
        }
    }
}

/// Everything a renderer needs for one frame of the overlay.
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub revision: u64,
    pub model_state: &'static str,
    pub model: String,
    pub generation_state: &'static str,
    pub generation: String,
    pub last_error: Option<String>,
    pub can_generate: bool,
    pub overlay: OverlayState,
    pub notification: Notification,
}

impl StateView {
    pub fn render(state: &OrchestratorState, overlay: OverlayState) -> Self {
        let model_state = match state.model {
            ModelStatus::Unloaded => "unloaded",
            ModelStatus::Loading => "loading",
            ModelStatus::Ready => "ready",
            ModelStatus::LoadFailed(_) => "load_failed",
        };
        let generation_state = match state.generation {
            GenerationStatus::Idle => "idle",
            GenerationStatus::Running(_) => "running",
            GenerationStatus::Succeeded(_) => "succeeded",
            GenerationStatus::Failed(_) => "failed",
        };
        Self {
            revision: state.revision,
            model_state,
            model: state.model.to_string(),
            generation_state,
            generation: state.generation.to_string(),
            last_error: state.last_error(),
            can_generate: state.can_generate(),
            overlay,
            notification: Notification::for_state(state),
        }
    }
}
