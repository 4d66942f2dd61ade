use std::fmt::{self, Display};

/// A command line flag of a node: either a bare switch or a flag followed by a value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeFlag {
    Switch,
    Value(String),
}

impl NodeFlag {
    pub fn value(value: impl Display) -> Self {
        Self::Value(value.to_string())
    }

    pub fn as_value(&self) -> Option<&str> {
        match self {
            Self::Switch => None,
            Self::Value(value) => Some(value),
        }
    }
}

impl Display for NodeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Switch => f.write_str("<switch>"),
            Self::Value(value) => f.write_str(value),
        }
    }
}

/// The configured flags of a node with unique keys, rendered in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    entries: Vec<(String, NodeFlag)>,
}

impl Flags {
    /// Sets `key`, replacing an earlier value in place.
    pub fn set(&mut self, key: impl Into<String>, flag: NodeFlag) {
        let key = key.into();
        match self.entries.iter_mut().find(|(known, _)| *known == key) {
            Some((_, existing)) => *existing = flag,
            None => self.entries.push((key, flag)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&NodeFlag> {
        self.entries
            .iter()
            .find_map(|(known, flag)| (known == key).then_some(flag))
    }

    /// The value of the first of `keys` that is set to a value.
    pub fn value_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|key| self.get(key).and_then(NodeFlag::as_value))
    }

    pub fn remove(&mut self, key: &str) -> Option<NodeFlag> {
        let position = self.entries.iter().position(|(known, _)| known == key)?;
        Some(self.entries.remove(position).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeFlag)> {
        self.entries.iter().map(|(key, flag)| (key.as_str(), flag))
    }

    /// Renders the flags as process arguments: `--key value` or `--key`, with underscores in keys
    /// turned into hyphens.
    pub fn to_arguments(&self) -> Vec<String> {
        let mut arguments = Vec::with_capacity(self.entries.len() * 2);
        for (key, flag) in &self.entries {
            arguments.push(format!("--{}", key.replace('_', "-")));
            if let NodeFlag::Value(value) = flag {
                arguments.push(value.clone());
            }
        }
        arguments
    }
}
