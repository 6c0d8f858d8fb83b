// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Address space contract consumed by the subscription server.
//!
//! The server never browses or models nodes itself. It only needs to know,
//! for a monitored item target, whether the node exists, what kind of value
//! it carries, its engineering-units range (for percent deadbands), whether
//! it is an event notifier, and its current value (for the initial sample).

use std::collections::HashMap;

use parking_lot::RwLock;
use trellis_core::{AttributeId, DataKind, DataValue, NodeId, StatusCode};

use crate::filter::EuRange;

/// What the server needs to know about a monitored node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeDescriptor {
    /// Declared value kind, `None` if unknown.
    pub data_kind: Option<DataKind>,
    /// Engineering-units range, for analog nodes.
    pub eu_range: Option<EuRange>,
    /// Whether the node produces events.
    pub event_notifier: bool,
    /// Current value, used for the first sample of a new item.
    pub value: Option<DataValue>,
}

/// Address space lookup.
pub trait NodeCatalog: Send + Sync {
    /// Describes `attribute` of `node`.
    ///
    /// Returns `BadNodeIdUnknown` for missing nodes and
    /// `BadAttributeIdInvalid` when the node does not have the attribute.
    fn describe(&self, node: &NodeId, attribute: AttributeId) -> Result<NodeDescriptor, StatusCode>;
}

/// Map-backed catalog.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    nodes: RwLock<HashMap<NodeId, NodeDescriptor>>,
}

impl StaticCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable node with an initial value.
    pub fn with_variable(self, node: NodeId, kind: DataKind, value: DataValue) -> Self {
        self.nodes.write().insert(
            node,
            NodeDescriptor {
                data_kind: Some(kind),
                value: Some(value),
                ..Default::default()
            },
        );
        self
    }

    /// Adds an analog variable with an engineering-units range.
    pub fn with_analog(self, node: NodeId, kind: DataKind, value: DataValue, range: EuRange) -> Self {
        self.nodes.write().insert(
            node,
            NodeDescriptor {
                data_kind: Some(kind),
                eu_range: Some(range),
                value: Some(value),
                event_notifier: false,
            },
        );
        self
    }

    /// Adds an event notifier node.
    pub fn with_notifier(self, node: NodeId) -> Self {
        self.nodes.write().insert(
            node,
            NodeDescriptor {
                event_notifier: true,
                ..Default::default()
            },
        );
        self
    }

    /// Stores the current value of a node, returning `false` if it is unknown.
    pub fn write(&self, node: &NodeId, value: DataValue) -> bool {
        match self.nodes.write().get_mut(node) {
            Some(descriptor) => {
                descriptor.value = Some(value);
                true
            }
            None => false,
        }
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Returns `true` if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl NodeCatalog for StaticCatalog {
    fn describe(&self, node: &NodeId, attribute: AttributeId) -> Result<NodeDescriptor, StatusCode> {
        let nodes = self.nodes.read();
        let descriptor = nodes.get(node).ok_or(StatusCode::BAD_NODE_ID_UNKNOWN)?;
        match attribute {
            AttributeId::EventNotifier if !descriptor.event_notifier => {
                Err(StatusCode::BAD_ATTRIBUTE_ID_INVALID)
            }
            AttributeId::Value if descriptor.data_kind.is_none() => {
                Err(StatusCode::BAD_ATTRIBUTE_ID_INVALID)
            }
            _ => Ok(descriptor.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let temp = NodeId::string(2, "Temperature");
        let alarms = NodeId::string(2, "Alarms");
        let catalog = StaticCatalog::new()
            .with_variable(temp.clone(), DataKind::Double, DataValue::new(21.5f64))
            .with_notifier(alarms.clone());

        assert_eq!(
            catalog.describe(&temp, AttributeId::Value).unwrap().data_kind,
            Some(DataKind::Double)
        );
        assert_eq!(
            catalog.describe(&temp, AttributeId::EventNotifier),
            Err(StatusCode::BAD_ATTRIBUTE_ID_INVALID)
        );
        assert!(catalog.describe(&alarms, AttributeId::EventNotifier).is_ok());
        assert_eq!(
            catalog.describe(&NodeId::numeric(2, 99), AttributeId::Value),
            Err(StatusCode::BAD_NODE_ID_UNKNOWN)
        );
    }

    #[test]
    fn test_write() {
        let temp = NodeId::string(2, "Temperature");
        let catalog =
            StaticCatalog::new().with_variable(temp.clone(), DataKind::Double, DataValue::new(1.0f64));
        assert!(catalog.write(&temp, DataValue::new(2.0f64)));
        assert!(!catalog.write(&NodeId::numeric(2, 1), DataValue::new(2.0f64)));
        let value = catalog.describe(&temp, AttributeId::Value).unwrap().value.unwrap();
        assert_eq!(value.value, Some(2.0f64.into()));
    }
}
