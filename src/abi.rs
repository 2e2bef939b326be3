//! Locates the watched event in an ABI document.

use std::{fs, path::Path};

use alloy::{
    dyn_abi::DynSolType,
    json_abi::{Event, JsonAbi},
    primitives::B256,
};

use crate::ListenerError;

/// EVM logs carry at most four topics, the first being the signature hash.
pub const MAX_INDEXED_INPUTS: usize = 3;

/// One declared input of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInput {
    /// Declared name, or `arg{position}` when the ABI leaves it empty.
    pub name: String,
    /// Canonical Solidity type, with tuples expanded (`(uint256,address)`).
    pub ty: String,
    pub indexed: bool,
}

/// The resolved event: name, canonical signature, topic0 and ordered inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSchema {
    pub name: String,
    pub signature: String,
    pub selector: B256,
    pub inputs: Vec<EventInput>,
}

impl EventSchema {
    /// Indexed inputs in declaration order, matching topics 1..n.
    pub fn indexed(&self) -> impl Iterator<Item = &EventInput> {
        self.inputs.iter().filter(|input| input.indexed)
    }

    /// Non-indexed inputs in declaration order, matching the data blob.
    pub fn non_indexed(&self) -> impl Iterator<Item = &EventInput> {
        self.inputs.iter().filter(|input| !input.indexed)
    }
}

impl TryFrom<&Event> for EventSchema {
    type Error = ListenerError;

    fn try_from(event: &Event) -> Result<Self, Self::Error> {
        let signature = event.signature();
        if event.anonymous {
            return Err(ListenerError::InvalidAbi(format!(
                "{signature} is anonymous and has no signature topic to filter on"
            )));
        }

        let indexed = event.inputs.iter().filter(|input| input.indexed).count();
        if indexed > MAX_INDEXED_INPUTS {
            return Err(ListenerError::InvalidAbi(format!(
                "{signature} declares {indexed} indexed inputs, at most {MAX_INDEXED_INPUTS} are allowed"
            )));
        }

        let inputs = event
            .inputs
            .iter()
            .enumerate()
            .map(|(position, input)| {
                let ty = input.selector_type().into_owned();
                DynSolType::parse(&ty).map_err(|err| {
                    ListenerError::InvalidAbi(format!("{signature}: unsupported type {ty}: {err}"))
                })?;
                let name =
                    if input.name.is_empty() { format!("arg{position}") } else { input.name.clone() };
                Ok(EventInput { name, ty, indexed: input.indexed })
            })
            .collect::<Result<Vec<_>, ListenerError>>()?;

        Ok(EventSchema { name: event.name.clone(), selector: event.selector(), signature, inputs })
    }
}

/// Resolve `query` against the events of `abi`.
///
/// `query` is either an exact, case-sensitive event name or a full canonical signature such as
/// `Transfer(address,address,uint256)`, which picks one overload of an overloaded event.
/// Whitespace is ignored around the query and inside a signature's parameter list.
pub fn resolve_event(abi: &JsonAbi, query: &str) -> Result<EventSchema, ListenerError> {
    let query = match query.trim().split_once('(') {
        Some((name, params)) => {
            let params: String = params.chars().filter(|c| !c.is_whitespace()).collect();
            format!("{}({params}", name.trim_end())
        }
        None => query.trim().to_owned(),
    };
    let name = query.split_once('(').map_or(query.as_str(), |(name, _)| name);

    let overloads = abi
        .events
        .get(name)
        .filter(|overloads| !overloads.is_empty())
        .ok_or_else(|| ListenerError::EventNotFound(query.clone()))?;

    let event = if query.contains('(') {
        overloads
            .iter()
            .find(|event| event.signature() == query)
            .ok_or_else(|| ListenerError::EventNotFound(query.clone()))?
    } else if let [event] = overloads.as_slice() {
        event
    } else {
        return Err(ListenerError::AmbiguousEvent {
            name: name.to_owned(),
            candidates: overloads.iter().map(Event::signature).collect(),
        });
    };

    let schema = EventSchema::try_from(event)?;
    debug!(event = %schema.signature, selector = %schema.selector, "Resolved event");
    Ok(schema)
}

/// Parse an ABI document.
///
/// Accepts a bare array of ABI items or a compiler artifact carrying them under `"abi"`.
pub fn parse_abi(json: &str) -> Result<JsonAbi, ListenerError> {
    let document: serde_json::Value =
        serde_json::from_str(json).map_err(|err| ListenerError::InvalidAbi(err.to_string()))?;
    let items = match document {
        serde_json::Value::Object(mut artifact) => artifact
            .remove("abi")
            .ok_or_else(|| ListenerError::InvalidAbi("object has no \"abi\" field".into()))?,
        other => other,
    };
    serde_json::from_value(items).map_err(|err| ListenerError::InvalidAbi(err.to_string()))
}

/// Read and parse the ABI document at `path`.
pub fn load_abi(path: &Path) -> Result<JsonAbi, ListenerError> {
    let json = fs::read_to_string(path).map_err(|err| {
        ListenerError::Config(format!("cannot read ABI file {}: {err}", path.display()))
    })?;
    parse_abi(&json)
}
