use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Notifications pushed by a [crate::provider::DataProvider] outside of any request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderEvent {
    /// New images were published in the listed cells.
    DataCreated { cell_ids: Vec<String> },
}

impl ProviderEvent {
    pub fn cell_ids(&self) -> &[String] {
        match self {
            ProviderEvent::DataCreated { cell_ids } => cell_ids,
        }
    }
}

impl Display for ProviderEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ProviderEvent::DataCreated { cell_ids } => {
                write!(f, "DataCreated({} cells)", cell_ids.len())
            }
        }
    }
}
