use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Descriptor returned by `list_connections`/`create_connection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub name: String,
    pub kind: String,
    pub category: &'static str,
    pub connected: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupportedConnector {
    pub category: &'static str,
    pub connection_fields: HashMap<&'static str, &'static str>,
}
