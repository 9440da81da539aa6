//! Lazily evaluated registry of named quantities.
//!
//! A node is either a constant or a derivation that reads other nodes by
//! name through the graph it is handed. Derived values are cached per
//! *generation*: every override, revert or re-registration bumps the
//! generation, which invalidates all cached derivations at once without
//! tracking dependency edges.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, trace};

use super::error::ModelError;
use super::income::SaleSimulation;
use super::position::Position;
use super::taxes::TaxTable;
use super::types::{SaleOrder, Shares};

pub type Derivation = Rc<dyn Fn(&ComputationGraph) -> Result<Value, ModelError>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Shares(Shares),
    Date(NaiveDate),
    Table(Rc<TaxTable>),
    Position(Rc<Position>),
    Orders(Rc<Vec<SaleOrder>>),
    Simulation(Rc<SaleSimulation>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Shares(_) => "shares",
            Value::Date(_) => "date",
            Value::Table(_) => "tax table",
            Value::Position(_) => "position",
            Value::Orders(_) => "sale orders",
            Value::Simulation(_) => "sale simulation",
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<Shares> for Value {
    fn from(value: Shares) -> Self {
        Value::Shares(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<TaxTable> for Value {
    fn from(value: TaxTable) -> Self {
        Value::Table(Rc::new(value))
    }
}

impl From<Position> for Value {
    fn from(value: Position) -> Self {
        Value::Position(Rc::new(value))
    }
}

impl From<Vec<SaleOrder>> for Value {
    fn from(value: Vec<SaleOrder>) -> Self {
        Value::Orders(Rc::new(value))
    }
}

impl From<SaleSimulation> for Value {
    fn from(value: SaleSimulation) -> Self {
        Value::Simulation(Rc::new(value))
    }
}

enum Node {
    Constant(Value),
    Derived(Derivation),
}

struct CachedValue {
    generation: u64,
    value: Value,
}

/// The evaluation substrate every domain quantity is registered on.
///
/// Single-threaded by construction (`Rc`/`RefCell`): one scenario is
/// overridden, evaluated and reverted at a time.
#[derive(Default)]
pub struct ComputationGraph {
    nodes: BTreeMap<String, Node>,
    overrides: HashMap<String, Value>,
    cache: RefCell<HashMap<String, CachedValue>>,
    generation: Cell<u64>,
    in_flight: RefCell<Vec<String>>,
}

impl ComputationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a constant node.
    pub fn register(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.insert(name.into(), Node::Constant(value.into()));
    }

    /// Registers (or replaces) a node derived from other nodes.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, derive: F)
    where
        F: Fn(&ComputationGraph) -> Result<Value, ModelError> + 'static,
    {
        self.insert(name.into(), Node::Derived(Rc::new(derive)));
    }

    fn insert(&mut self, name: String, node: Node) {
        self.nodes.insert(name, node);
        self.bump_generation();
    }

    fn bump_generation(&self) {
        self.generation.set(self.generation.get() + 1);
    }

    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Every registered node name, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    pub fn is_overridden(&self, name: &str) -> bool {
        self.overrides.contains_key(name)
    }

    pub fn override_value(&self, name: &str) -> Option<&Value> {
        self.overrides.get(name)
    }

    /// Pins `name` to `value` until reverted.
    pub fn override_node(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ModelError> {
        if !self.contains(name) {
            return Err(ModelError::UnknownNode(name.to_string()));
        }
        let value = value.into();
        debug!(node = name, ?value, "override");
        self.overrides.insert(name.to_string(), value);
        self.bump_generation();
        Ok(())
    }

    /// Drops an override; the node is derived (or constant) again.
    pub fn revert(&mut self, name: &str) -> Result<(), ModelError> {
        if !self.contains(name) {
            return Err(ModelError::UnknownNode(name.to_string()));
        }
        if self.overrides.remove(name).is_some() {
            debug!(node = name, "revert");
        }
        self.bump_generation();
        Ok(())
    }

    pub fn revert_all(&mut self) {
        self.overrides.clear();
        self.bump_generation();
    }

    /// Forces every derived node to be recomputed on next access.
    pub fn invalidate(&self) {
        self.bump_generation();
    }

    /// Resolves `name`, evaluating dependencies on demand.
    pub fn value(&self, name: &str) -> Result<Value, ModelError> {
        if let Some(pinned) = self.overrides.get(name) {
            return Ok(pinned.clone());
        }
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| ModelError::UnknownNode(name.to_string()))?;
        let derive = match node {
            Node::Constant(value) => return Ok(value.clone()),
            Node::Derived(derive) => Rc::clone(derive),
        };

        let generation = self.generation.get();
        if let Some(hit) = self.cache.borrow().get(name) {
            if hit.generation == generation {
                return Ok(hit.value.clone());
            }
        }

        self.enter(name)?;
        trace!(node = name, generation, "evaluate");
        let result = derive(self);
        self.in_flight.borrow_mut().pop();
        let value = result?;

        // never cache under a generation that went stale mid-derivation
        if self.generation.get() == generation {
            self.cache.borrow_mut().insert(
                name.to_string(),
                CachedValue {
                    generation,
                    value: value.clone(),
                },
            );
        }
        Ok(value)
    }

    fn enter(&self, name: &str) -> Result<(), ModelError> {
        let mut in_flight = self.in_flight.borrow_mut();
        if let Some(pos) = in_flight.iter().position(|n| n == name) {
            let mut path: Vec<String> = in_flight[pos..].to_vec();
            path.push(name.to_string());
            return Err(ModelError::CycleDetected { path });
        }
        in_flight.push(name.to_string());
        Ok(())
    }

    fn mismatch(name: &str, expected: &'static str, found: &Value) -> ModelError {
        ModelError::TypeMismatch {
            node: name.to_string(),
            expected,
            found: found.kind(),
        }
    }

    /// Reads a monetary or rate node; share counts widen to `f64`.
    pub fn number(&self, name: &str) -> Result<f64, ModelError> {
        match self.value(name)? {
            Value::Number(v) => Ok(v),
            Value::Shares(v) => Ok(v as f64),
            other => Err(Self::mismatch(name, "number", &other)),
        }
    }

    /// Reads a share count; whole-valued numbers are accepted.
    pub fn shares(&self, name: &str) -> Result<Shares, ModelError> {
        match self.value(name)? {
            Value::Shares(v) => Ok(v),
            Value::Number(v) if v.is_finite() && v.fract() == 0.0 => Ok(v as Shares),
            other => Err(Self::mismatch(name, "shares", &other)),
        }
    }

    pub fn date(&self, name: &str) -> Result<NaiveDate, ModelError> {
        match self.value(name)? {
            Value::Date(v) => Ok(v),
            other => Err(Self::mismatch(name, "date", &other)),
        }
    }

    pub fn table(&self, name: &str) -> Result<Rc<TaxTable>, ModelError> {
        match self.value(name)? {
            Value::Table(v) => Ok(v),
            other => Err(Self::mismatch(name, "tax table", &other)),
        }
    }

    pub fn position(&self, name: &str) -> Result<Rc<Position>, ModelError> {
        match self.value(name)? {
            Value::Position(v) => Ok(v),
            other => Err(Self::mismatch(name, "position", &other)),
        }
    }

    pub fn orders(&self, name: &str) -> Result<Rc<Vec<SaleOrder>>, ModelError> {
        match self.value(name)? {
            Value::Orders(v) => Ok(v),
            other => Err(Self::mismatch(name, "sale orders", &other)),
        }
    }

    pub fn simulation(&self, name: &str) -> Result<Rc<SaleSimulation>, ModelError> {
        match self.value(name)? {
            Value::Simulation(v) => Ok(v),
            other => Err(Self::mismatch(name, "sale simulation", &other)),
        }
    }
}
