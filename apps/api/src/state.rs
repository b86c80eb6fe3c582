use crate::insights::coordinator::GenerationCoordinator;

/// Shared application state injected into all route handlers via Axum extractors.
///
/// Handlers only reach the insight stores through the coordinator.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: GenerationCoordinator,
}
