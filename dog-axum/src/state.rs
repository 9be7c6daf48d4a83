use std::sync::Arc;

use dog_relay::RelayPipeline;

/// Shared by every file route: the node's relay path and the key served
/// by the key-less download routes.
#[derive(Clone)]
pub struct DogAxumState {
    pub pipeline: Arc<RelayPipeline>,
    pub default_key: Option<Arc<str>>,
}

impl DogAxumState {
    pub fn new(pipeline: RelayPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            default_key: None,
        }
    }

    pub fn with_default_key<S: AsRef<str>>(mut self, key: Option<S>) -> Self {
        self.default_key = key.map(|k| Arc::from(k.as_ref()));
        self
    }
}
