//! Navigation hooks into the surrounding application

/// Moves the user to another route of the application
///
/// The session layer only ever asks to go to the login entry point; what
/// "navigating" means is up to the application.
pub trait Navigator: Send + Sync {
    /// Navigates to `route`
    fn navigate(&self, route: &str);
}

impl<F> Navigator for F
where
    F: Fn(&str) + Send + Sync,
{
    fn navigate(&self, route: &str) {
        self(route)
    }
}

/// A navigator that only records the request in the trace log
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNavigator;

impl Navigator for TracingNavigator {
    fn navigate(&self, route: &str) {
        tracing::info!(route, "navigation requested");
    }
}
