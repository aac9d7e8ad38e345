//! Bounded name → bytes tables for container metadata.
//!
//! Fixed metalayers are few, short-named, and may only be updated in
//! place with content of the same length.  Variable-length metalayers
//! allow many more entries with longer names and content that can grow
//! or shrink; the container stores their content compressed.

use log::debug;

use crate::error::{Error, Result};

pub const MAX_METALAYERS:          usize = 16;
pub const METALAYER_NAME_MAXLEN:   usize = 31;
pub const MAX_VLMETALAYERS:        usize = 8192;
pub const VLMETALAYER_NAME_MAXLEN: usize = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Fixed,
    Variable,
}

impl LayerKind {
    fn max_entries(self) -> usize {
        match self {
            LayerKind::Fixed    => MAX_METALAYERS,
            LayerKind::Variable => MAX_VLMETALAYERS,
        }
    }

    fn max_name(self) -> usize {
        match self {
            LayerKind::Fixed    => METALAYER_NAME_MAXLEN,
            LayerKind::Variable => VLMETALAYER_NAME_MAXLEN,
        }
    }
}

/// Insertion-ordered metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaTable {
    kind:    LayerKind,
    entries: Vec<(String, Vec<u8>)>,
}

impl MetaTable {
    pub fn new(kind: LayerKind) -> Self {
        Self { kind, entries: Vec::new() }
    }

    /// Rebuild a table read back from a frame, applying the same limits as
    /// [`MetaTable::add`].
    pub(crate) fn from_entries(kind: LayerKind, entries: Vec<(String, Vec<u8>)>) -> Result<Self> {
        let mut table = Self::new(kind);
        for (name, content) in entries {
            table.add(&name, content).map_err(|e| Error::corrupt(e.to_string()))?;
        }
        Ok(table)
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > self.kind.max_name() {
            return Err(Error::invalid(format!(
                "name must be 1..={} bytes, got {}", self.kind.max_name(), name.len()
            )).at_metalayer(name));
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Add a new entry and return its index.
    pub fn add(&mut self, name: &str, content: Vec<u8>) -> Result<usize> {
        self.check_name(name)?;
        if self.exists(name) {
            return Err(Error::invalid("already exists").at_metalayer(name));
        }
        if self.entries.len() >= self.kind.max_entries() {
            return Err(Error::ResourceExhausted(format!(
                "all {} {:?} metalayer slots are in use", self.kind.max_entries(), self.kind
            )).at_metalayer(name));
        }
        if u32::try_from(content.len()).is_err() {
            return Err(Error::invalid("content exceeds 4 GiB").at_metalayer(name));
        }
        debug!("adding {:?} metalayer '{name}' ({} bytes)", self.kind, content.len());
        self.entries.push((name.to_owned(), content));
        Ok(self.entries.len() - 1)
    }

    /// Replace the content of an existing entry and return its index.
    /// Fixed layers reject a change of length.
    pub fn update(&mut self, name: &str, content: Vec<u8>) -> Result<usize> {
        let idx = self.position(name).ok_or_else(|| Error::NotFound("no such metalayer".into()).at_metalayer(name))?;
        if self.kind == LayerKind::Fixed && self.entries[idx].1.len() != content.len() {
            return Err(Error::invalid(format!(
                "fixed metalayer is {} bytes, update has {}", self.entries[idx].1.len(), content.len()
            )).at_metalayer(name));
        }
        if u32::try_from(content.len()).is_err() {
            return Err(Error::invalid("content exceeds 4 GiB").at_metalayer(name));
        }
        self.entries[idx].1 = content;
        Ok(idx)
    }

    pub fn get(&self, name: &str) -> Result<&[u8]> {
        self.position(name)
            .map(|i| self.entries[i].1.as_slice())
            .ok_or_else(|| Error::NotFound("no such metalayer".into()).at_metalayer(name))
    }

    /// Remove an entry, returning how many remain.
    pub fn delete(&mut self, name: &str) -> Result<usize> {
        let idx = self.position(name).ok_or_else(|| Error::NotFound("no such metalayer".into()).at_metalayer(name))?;
        self.entries.remove(idx);
        debug!("deleted {:?} metalayer '{name}'", self.kind);
        Ok(self.entries.len())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn entries(&self) -> &[(String, Vec<u8>)] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn fixed_layer_keeps_size() {
        let mut t = MetaTable::new(LayerKind::Fixed);
        assert_eq!(t.add("shape", vec![1, 2, 3]).unwrap(), 0);
        assert_eq!(t.add("shape", vec![1]).unwrap_err().kind(), ErrorKind::InvalidParameter);
        t.update("shape", vec![4, 5, 6]).unwrap();
        assert_eq!(t.get("shape").unwrap(), &[4, 5, 6]);
        assert_eq!(t.update("shape", vec![1]).unwrap_err().kind(), ErrorKind::InvalidParameter);
        assert_eq!(t.get("dtype").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn capacity_and_name_limits() {
        let mut t = MetaTable::new(LayerKind::Fixed);
        for i in 0..MAX_METALAYERS {
            t.add(&format!("m{i}"), vec![]).unwrap();
        }
        let err = t.add("one-too-many", vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("one-too-many"));

        let long = "x".repeat(METALAYER_NAME_MAXLEN + 1);
        let mut t = MetaTable::new(LayerKind::Fixed);
        assert_eq!(t.add(&long, vec![]).unwrap_err().kind(), ErrorKind::InvalidParameter);
        let mut v = MetaTable::new(LayerKind::Variable);
        v.add(&long, vec![]).unwrap();
    }

    #[test]
    fn variable_layer_resizes_and_deletes() {
        let mut t = MetaTable::new(LayerKind::Variable);
        t.add("a", vec![1]).unwrap();
        t.add("b", vec![2]).unwrap();
        t.update("a", vec![1; 100]).unwrap();
        assert_eq!(t.get("a").unwrap().len(), 100);
        assert_eq!(t.delete("a").unwrap(), 1);
        assert_eq!(t.names(), vec!["b".to_string()]);
        assert_eq!(t.delete("a").unwrap_err().kind(), ErrorKind::NotFound);
    }
}
