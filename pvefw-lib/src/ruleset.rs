use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha1::{Digest, Sha1};
use thiserror::Error;

use std::collections::BTreeMap;

/// The kernel's limit for filter chain names.
pub const MAX_CHAIN_NAME_LEN: usize = 28;

#[derive(Debug, Error)]
pub enum Error {
    #[error("chain name `{0}` exceeds {MAX_CHAIN_NAME_LEN} bytes")]
    NameTooLong(String),
    #[error("chain `{0}` created twice")]
    DuplicateChain(String),
    #[error("rule for unknown chain `{0}`")]
    UnknownChain(String),
}

/// A compiled ruleset: chain name to ordered, fully formed filter command
/// lines. Chains are created exactly once, rule order is significant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ruleset {
    chains: BTreeMap<String, Vec<String>>,
}

impl Ruleset {
    pub fn new() -> Self {
        Ruleset::default()
    }

    pub fn create_chain(&mut self, name: &str) -> Result<(), Error> {
        if name.len() > MAX_CHAIN_NAME_LEN {
            return Err(Error::NameTooLong(name.to_string()));
        }
        if self.chains.contains_key(name) {
            return Err(Error::DuplicateChain(name.to_string()));
        }
        self.chains.insert(name.to_string(), Vec::new());
        Ok(())
    }

    pub fn has_chain(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    /// Append a command line to an existing chain.
    pub fn addrule(&mut self, chain: &str, cmd: String) -> Result<(), Error> {
        self.chains
            .get_mut(chain)
            .ok_or_else(|| Error::UnknownChain(chain.to_string()))?
            .push(cmd);
        Ok(())
    }

    /// Insert a command line at the top of an existing chain.
    pub fn insertrule(&mut self, chain: &str, cmd: String) -> Result<(), Error> {
        self.chains
            .get_mut(chain)
            .ok_or_else(|| Error::UnknownChain(chain.to_string()))?
            .insert(0, cmd);
        Ok(())
    }

    pub fn rules(&self, chain: &str) -> Option<&[String]> {
        self.chains.get(chain).map(Vec::as_slice)
    }

    pub fn chains(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.chains.iter().map(|(name, rules)| (name.as_str(), rules.as_slice()))
    }

    pub fn chain_names(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Content signature of a chain, if it exists.
    pub fn sig(&self, chain: &str) -> Option<String> {
        self.chains.get(chain).map(|rules| signature(rules))
    }
}

/// Base64 SHA-1 over the chain's command lines, one trailing newline per
/// line. Unpadded, so the digest can live inside a comment match untouched.
pub fn signature<S: AsRef<str>>(lines: &[S]) -> String {
    let mut hasher = Sha1::new();
    for line in lines {
        hasher.update(line.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    STANDARD_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_are_bounded_at_28_bytes() -> anyhow::Result<()> {
        let mut ruleset = Ruleset::new();
        let exact = "a".repeat(28);
        let over = "a".repeat(29);
        ruleset.create_chain(&exact)?;
        assert!(matches!(ruleset.create_chain(&over), Err(Error::NameTooLong(_))));
        Ok(())
    }

    #[test]
    fn chains_are_created_exactly_once() -> anyhow::Result<()> {
        let mut ruleset = Ruleset::new();
        ruleset.create_chain("PVEFW-INPUT")?;
        assert!(matches!(
            ruleset.create_chain("PVEFW-INPUT"),
            Err(Error::DuplicateChain(_))
        ));
        Ok(())
    }

    #[test]
    fn rules_for_unknown_chains_are_rejected() {
        let mut ruleset = Ruleset::new();
        assert!(matches!(
            ruleset.addrule("nope", "-A nope -j DROP".to_string()),
            Err(Error::UnknownChain(_))
        ));
    }

    #[test]
    fn insertrule_prepends_addrule_appends() -> anyhow::Result<()> {
        let mut ruleset = Ruleset::new();
        ruleset.create_chain("vmbr0-IN")?;
        ruleset.addrule("vmbr0-IN", "second".to_string())?;
        ruleset.insertrule("vmbr0-IN", "first".to_string())?;
        assert_eq!(ruleset.rules("vmbr0-IN").unwrap(), ["first", "second"]);
        Ok(())
    }

    #[test]
    fn signature_is_unpadded_base64_sha1() -> anyhow::Result<()> {
        let sig = signature(&["-A X -j ACCEPT"]);
        assert_eq!(sig.len(), 27);
        assert!(!sig.contains('='));
        Ok(())
    }

    #[test]
    fn signature_depends_on_content_and_order() -> anyhow::Result<()> {
        let a = signature(&["one", "two"]);
        let b = signature(&["two", "one"]);
        let c = signature(&["one", "two"]);
        assert_ne!(a, b);
        assert_eq!(a, c);
        Ok(())
    }
}
