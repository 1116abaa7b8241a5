// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Port declarations used for graph validation and connection construction.
//!
//! ## Key concepts:
//! - [`Key`]: A port id tagged with the payload type carried on it
//! - [`PortSpec`]: A node body's declaration of one port
//! - [`PortCardinality`]: How many consumers an output port accepts
//! - [`PortDescriptor`]: Serializable view of a [`PortSpec`] for the graph model

use crate::connection::{Connection, ErasedConnection};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;

/// A port id tagged with its payload type.
///
/// Declared as constants by node bodies, e.g. `const OUT: Key<Tick> = Key::new("out");`,
/// and used to get typed access to connections and channels from the node context.
pub struct Key<T> {
    id: &'static str,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(id: &'static str) -> Self {
        Self { id, _payload: PhantomData }
    }

    pub const fn id(&self) -> &'static str {
        self.id
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.id)
    }
}

/// Direction of data on a port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

/// Describes the connection cardinality of an output port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortCardinality {
    /// Exactly one consumer allowed.
    One,

    /// Any number of consumers; every event is shared with all of them.
    #[default]
    Broadcast,
}

type ConnectionFactory = fn(PortCardinality, usize) -> Box<dyn ErasedConnection>;

fn make_connection<T: Send + Sync + 'static>(
    cardinality: PortCardinality,
    delivery_capacity: usize,
) -> Box<dyn ErasedConnection> {
    Box::new(Connection::<T>::new(cardinality, delivery_capacity))
}

/// A node body's declaration of one port.
#[derive(Clone)]
pub struct PortSpec {
    pub id: &'static str,
    pub direction: PortDirection,
    /// Tag compared when validating links, e.g. `"video/frame"`.
    pub data_type: &'static str,
    pub cardinality: PortCardinality,
    payload: TypeId,
    payload_name: &'static str,
    factory: Option<ConnectionFactory>,
}

impl PortSpec {
    /// Declares an output port producing `T`.
    pub fn output<T: Send + Sync + 'static>(
        key: Key<T>,
        data_type: &'static str,
        cardinality: PortCardinality,
    ) -> Self {
        Self {
            id: key.id(),
            direction: PortDirection::Output,
            data_type,
            cardinality,
            payload: TypeId::of::<T>(),
            payload_name: std::any::type_name::<T>(),
            factory: Some(make_connection::<T>),
        }
    }

    /// Declares an input port consuming `T`.
    pub fn input<T: Send + Sync + 'static>(key: Key<T>, data_type: &'static str) -> Self {
        Self {
            id: key.id(),
            direction: PortDirection::Input,
            data_type,
            cardinality: PortCardinality::One,
            payload: TypeId::of::<T>(),
            payload_name: std::any::type_name::<T>(),
            factory: None,
        }
    }

    pub const fn payload_type(&self) -> TypeId {
        self.payload
    }

    pub const fn payload_name(&self) -> &'static str {
        self.payload_name
    }

    /// Builds the connection backing this output port.
    ///
    /// Returns `None` for input ports.
    pub fn build_connection(&self, delivery_capacity: usize) -> Option<Box<dyn ErasedConnection>> {
        self.factory.map(|factory| factory(self.cardinality, delivery_capacity))
    }

    pub fn descriptor(&self) -> PortDescriptor {
        PortDescriptor {
            id: self.id.to_string(),
            direction: self.direction,
            data_type: self.data_type.to_string(),
            cardinality: self.cardinality,
        }
    }
}

impl fmt::Debug for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSpec")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("data_type", &self.data_type)
            .field("cardinality", &self.cardinality)
            .field("payload", &self.payload_name)
            .finish()
    }
}

/// Serializable description of a port, as exposed by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PortDescriptor {
    pub id: String,
    pub direction: PortDirection,
    pub data_type: String,
    #[serde(default)]
    pub cardinality: PortCardinality,
}
