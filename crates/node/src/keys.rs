//! Account and network identities derived with the node binary's `key` subcommands.

use std::{
    ffi::OsStr,
    fmt::{self, Display},
    path::Path,
    sync::LazyLock,
};

use chainrunner_common::{Error, Result, fs::ensure_file};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::process::run_to_completion;

static SS58_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)SS58 Address:\s*(\w+)$").expect("valid regex"));

/// An SS58 encoded account identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AccountId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Seed phrases and the accounts derived from them, in the order the phrases were given.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AccountKeys {
    entries: Vec<(String, AccountId)>,
}

impl AccountKeys {
    /// Adds or replaces the account of `phrase`; a replaced entry keeps its position.
    pub fn insert(&mut self, phrase: impl Into<String>, account: AccountId) {
        let phrase = phrase.into();
        match self.entries.iter_mut().find(|(known, _)| *known == phrase) {
            Some((_, existing)) => *existing = account,
            None => self.entries.push((phrase, account)),
        }
    }

    pub fn get(&self, phrase: &str) -> Option<&AccountId> {
        self.entries
            .iter()
            .find_map(|(known, account)| (known == phrase).then_some(account))
    }

    pub fn accounts(&self) -> impl Iterator<Item = &AccountId> {
        self.entries.iter().map(|(_, account)| account)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AccountId)> {
        self.entries
            .iter()
            .map(|(phrase, account)| (phrase.as_str(), account))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derives the account of every phrase with `{binary} key inspect {phrase}`.
pub fn generate_keys<I, S>(binary: &Path, phrases: I) -> Result<AccountKeys>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    ensure_file(binary)?;

    let mut keys = AccountKeys::default();
    for phrase in phrases {
        let phrase = phrase.as_ref();
        let output = run_to_completion(binary, ["key", "inspect", phrase])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let account = parse_ss58_address(&stdout).ok_or_else(|| Error::Process {
            command: format!("{} key inspect {phrase}", binary.display()),
            reason: "output carries no SS58 address".to_owned(),
        })?;
        debug!(phrase, %account, "Derived account");
        keys.insert(phrase, account);
    }
    Ok(keys)
}

/// Reads the libp2p peer id stored in `key_file` with `{binary} key inspect-node-key`.
pub fn peer_id(binary: &Path, key_file: &Path) -> Result<String> {
    let arguments = [
        OsStr::new("key"),
        OsStr::new("inspect-node-key"),
        OsStr::new("--file"),
        key_file.as_os_str(),
    ];
    let output = run_to_completion(binary, arguments)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

pub(crate) fn parse_ss58_address(output: &str) -> Option<AccountId> {
    SS58_ADDRESS
        .captures(output)
        .and_then(|captures| captures.get(1))
        .map(|address| AccountId::from(address.as_str()))
}
