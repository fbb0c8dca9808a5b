use serde::Deserialize;

/// Config carries the engine's startup options. Hosts typically lift it out
/// of their own configuration file with serde.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory recordings are written to and replayed from.
    pub path: String,
    /// Whether lifecycle observability events are emitted through the
    /// configured sink.
    #[serde(default)]
    pub events: bool,
}

impl Config {
    pub fn new(path: impl Into<String>) -> Self {
        Config {
            path: path.into(),
            events: false,
        }
    }

    pub fn with_events(mut self, events: bool) -> Self {
        self.events = events;
        self
    }
}
