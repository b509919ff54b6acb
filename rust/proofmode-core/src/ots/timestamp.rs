//! The timestamp tree.
//!
//! A [`Timestamp`] proves that its message existed no later than the time
//! asserted by any of the attestations reachable from it. Every edge is an
//! [`Op`]; the child's message is always the op applied to the parent's.

use super::attestation::{Attestation, Chain};
use super::errors::{DeserializeError, TimestampError};
use super::op::Op;
use super::ser::{Deserializer, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Read, Write};

pub const RECURSION_LIMIT: usize = 256;

const TAG_ATTESTATION: u8 = 0x00;
const TAG_CONTINUE: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp {
    msg: Vec<u8>,
    attestations: BTreeSet<Attestation>,
    ops: BTreeMap<Op, Timestamp>,
}

impl Timestamp {
    pub fn new(msg: impl Into<Vec<u8>>) -> Self {
        Self {
            msg: msg.into(),
            attestations: BTreeSet::new(),
            ops: BTreeMap::new(),
        }
    }

    pub fn msg(&self) -> &[u8] {
        &self.msg
    }

    pub fn attestations(&self) -> &BTreeSet<Attestation> {
        &self.attestations
    }

    pub fn ops(&self) -> &BTreeMap<Op, Timestamp> {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.attestations.is_empty() && self.ops.is_empty()
    }

    pub fn add_attestation(&mut self, attestation: Attestation) -> bool {
        self.attestations.insert(attestation)
    }

    /// Returns the child reached through `op`, creating it if needed.
    pub fn add_op(&mut self, op: Op) -> Result<&mut Timestamp, TimestampError> {
        if !self.ops.contains_key(&op) {
            let child = Timestamp::new(op.apply(&self.msg)?);
            self.ops.insert(op.clone(), child);
        }
        Ok(self
            .ops
            .get_mut(&op)
            .expect("child inserted above"))
    }

    pub fn deserialize<R: Read>(
        de: &mut Deserializer<R>,
        msg: Vec<u8>,
    ) -> Result<Self, DeserializeError> {
        Self::deserialize_at_depth(de, msg, 0)
    }

    fn deserialize_at_depth<R: Read>(
        de: &mut Deserializer<R>,
        msg: Vec<u8>,
        depth: usize,
    ) -> Result<Self, DeserializeError> {
        if depth > RECURSION_LIMIT {
            return Err(DeserializeError::RecursionLimit);
        }

        let mut stamp = Timestamp::new(msg);
        let mut tag = de.read_byte()?;
        while tag == TAG_CONTINUE {
            let current = de.read_byte()?;
            stamp.read_entry(de, current, depth)?;
            tag = de.read_byte()?;
        }
        stamp.read_entry(de, tag, depth)?;
        Ok(stamp)
    }

    fn read_entry<R: Read>(
        &mut self,
        de: &mut Deserializer<R>,
        tag: u8,
        depth: usize,
    ) -> Result<(), DeserializeError> {
        if tag == TAG_ATTESTATION {
            let attestation = Attestation::deserialize(de)?;
            self.attestations.insert(attestation);
            return Ok(());
        }

        let op = Op::deserialize_with_tag(de, tag)?;
        let result = op.apply(&self.msg)?;
        let child = Self::deserialize_at_depth(de, result, depth + 1)?;
        // A repeated op replaces the earlier branch.
        self.ops.insert(op, child);
        Ok(())
    }

    pub fn serialize<W: Write>(&self, ser: &mut Serializer<W>) -> Result<(), TimestampError> {
        if self.is_empty() {
            return Err(TimestampError::EmptyTimestamp);
        }

        let attestations: Vec<&Attestation> = self.attestations.iter().collect();
        if attestations.len() > 1 {
            for attestation in &attestations[..attestations.len() - 1] {
                ser.write_bytes(&[TAG_CONTINUE, TAG_ATTESTATION])?;
                attestation.serialize(ser)?;
            }
        }

        if self.ops.is_empty() {
            ser.write_byte(TAG_ATTESTATION)?;
            if let Some(last) = attestations.last() {
                last.serialize(ser)?;
            }
            return Ok(());
        }

        if let Some(last) = attestations.last() {
            ser.write_bytes(&[TAG_CONTINUE, TAG_ATTESTATION])?;
            last.serialize(ser)?;
        }

        let count = self.ops.len();
        for (i, (op, child)) in self.ops.iter().enumerate() {
            if i + 1 < count {
                ser.write_byte(TAG_CONTINUE)?;
            }
            op.serialize(ser)?;
            child.serialize(ser)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TimestampError> {
        let mut ser = Serializer::new(Vec::new());
        self.serialize(&mut ser)?;
        Ok(ser.into_inner())
    }

    /// Parses a standalone serialized timestamp; trailing bytes are rejected.
    pub fn from_bytes(data: &[u8], msg: Vec<u8>) -> Result<Self, DeserializeError> {
        let mut de = Deserializer::from_slice(data);
        let stamp = Self::deserialize(&mut de, msg)?;
        de.assert_eof()?;
        Ok(stamp)
    }

    /// Unions `other` into `self`. Both must describe the same message.
    pub fn merge(&mut self, other: &Timestamp) -> Result<(), TimestampError> {
        if self.msg != other.msg {
            return Err(TimestampError::MsgMismatch);
        }
        self.attestations
            .extend(other.attestations.iter().cloned());
        for (op, other_child) in &other.ops {
            let ours = self.add_op(op.clone())?;
            ours.merge(other_child)?;
        }
        Ok(())
    }

    /// Every `(msg, attestation)` pair reachable from this node.
    pub fn all_attestations(&self) -> Vec<(Vec<u8>, Attestation)> {
        let mut out = Vec::new();
        self.collect_attestations(&mut out);
        out
    }

    fn collect_attestations(&self, out: &mut Vec<(Vec<u8>, Attestation)>) {
        for attestation in &self.attestations {
            out.push((self.msg.clone(), attestation.clone()));
        }
        for child in self.ops.values() {
            child.collect_attestations(out);
        }
    }

    /// Distinct attestations anywhere in the tree.
    pub fn attestation_set(&self) -> BTreeSet<Attestation> {
        self.all_attestations()
            .into_iter()
            .map(|(_, attestation)| attestation)
            .collect()
    }

    /// True once at least one block header attestation is reachable.
    pub fn is_complete(&self) -> bool {
        self.attestations.iter().any(|a| a.block().is_some())
            || self.ops.values().any(Timestamp::is_complete)
    }

    pub fn find(&self, msg: &[u8]) -> Option<&Timestamp> {
        if self.msg == msg {
            return Some(self);
        }
        self.ops.values().find_map(|child| child.find(msg))
    }

    pub fn find_mut(&mut self, msg: &[u8]) -> Option<&mut Timestamp> {
        if self.msg == msg {
            return Some(self);
        }
        self.ops.values_mut().find_map(|child| child.find_mut(msg))
    }

    /// Prunes the tree down to the single path leading to the best
    /// attestation and returns that attestation.
    ///
    /// Bitcoin beats Litecoin beats Ethereum, lower heights win within a
    /// chain, and a pending attestation is only kept when no block
    /// attestation exists.
    pub fn shrink(&mut self) -> Result<Attestation, TimestampError> {
        let best = self
            .all_attestations()
            .into_iter()
            .map(|(_, attestation)| attestation)
            .min_by_key(shrink_rank)
            .ok_or(TimestampError::NoAttestations)?;

        let kept = self.retain_path(&best);
        debug_assert!(kept);
        Ok(best)
    }

    fn retain_path(&mut self, target: &Attestation) -> bool {
        if self.attestations.contains(target) {
            self.attestations.retain(|a| a == target);
            self.ops.clear();
            return true;
        }

        let mut keep: Option<Op> = None;
        for (op, child) in self.ops.iter_mut() {
            if child.retain_path(target) {
                keep = Some(op.clone());
                break;
            }
        }

        match keep {
            Some(op) => {
                self.attestations.clear();
                self.ops.retain(|candidate, _| *candidate == op);
                true
            }
            None => false,
        }
    }

    /// Indented rendering of the tree in the style of `ots info`.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.write_pretty(&mut out, 0);
        out
    }

    fn write_pretty(&self, out: &mut String, indent: usize) {
        let pad = " ".repeat(indent);
        for attestation in &self.attestations {
            out.push_str(&format!("{}verify {}\n", pad, attestation));
        }

        let fork = self.ops.len() > 1;
        for (op, child) in &self.ops {
            if fork {
                out.push_str(&format!("{} -> {}\n", pad, op));
                child.write_pretty(out, indent + 4);
            } else {
                out.push_str(&format!("{}{}\n", pad, op));
                child.write_pretty(out, indent);
            }
        }
    }
}

fn shrink_rank(attestation: &Attestation) -> (u8, u64) {
    match attestation.block() {
        Some((Chain::Bitcoin, height)) => (0, height),
        Some((Chain::Litecoin, height)) => (1, height),
        Some((Chain::Ethereum, height)) => (2, height),
        None if attestation.is_pending() => (3, 0),
        None => (4, 0),
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}
