//! Nonce-salted Merkle aggregation of several digests into one commitment.

use super::errors::TimestampError;
use super::op::Op;
use super::timestamp::Timestamp;

pub const NONCE_LEN: usize = 16;

/// Per-file timestamps whose paths all end at one common root message.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    leaves: Vec<Timestamp>,
    root_msg: Vec<u8>,
    level_sizes: Vec<usize>,
}

struct Node {
    msg: Vec<u8>,
    members: Vec<usize>,
}

pub fn make_merkle_tree<D: AsRef<[u8]>>(digests: &[D]) -> Result<MerkleTree, TimestampError> {
    make_merkle_tree_with(digests, rand::random::<[u8; NONCE_LEN]>)
}

pub(crate) fn make_merkle_tree_with<D, F>(
    digests: &[D],
    mut nonce: F,
) -> Result<MerkleTree, TimestampError>
where
    D: AsRef<[u8]>,
    F: FnMut() -> [u8; NONCE_LEN],
{
    if digests.is_empty() {
        return Err(TimestampError::EmptyMerkleInput);
    }

    let mut paths: Vec<Vec<Op>> = Vec::with_capacity(digests.len());
    let mut level: Vec<Node> = Vec::with_capacity(digests.len());

    for (index, digest) in digests.iter().enumerate() {
        // The nonce keeps a sibling's digest from being guessable out of a
        // split-off proof.
        let append = Op::Append(nonce().to_vec());
        let salted = Op::Sha256.apply(&append.apply(digest.as_ref())?)?;
        paths.push(vec![append, Op::Sha256]);
        level.push(Node {
            msg: salted,
            members: vec![index],
        });
    }

    let mut level_sizes = vec![level.len()];
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        let mut nodes = level.into_iter();
        while let Some(left) = nodes.next() {
            let Some(right) = nodes.next() else {
                next.push(left);
                break;
            };

            for &member in &left.members {
                paths[member].push(Op::Append(right.msg.clone()));
                paths[member].push(Op::Sha256);
            }
            for &member in &right.members {
                paths[member].push(Op::Prepend(left.msg.clone()));
                paths[member].push(Op::Sha256);
            }

            let mut concat = left.msg.clone();
            concat.extend_from_slice(&right.msg);
            let mut members = left.members;
            members.extend(right.members);
            next.push(Node {
                msg: Op::Sha256.apply(&concat)?,
                members,
            });
        }
        level_sizes.push(next.len());
        level = next;
    }

    let root_msg = level
        .pop()
        .map(|node| node.msg)
        .ok_or(TimestampError::EmptyMerkleInput)?;

    let mut leaves = Vec::with_capacity(digests.len());
    for (digest, path) in digests.iter().zip(paths) {
        let mut stamp = Timestamp::new(digest.as_ref().to_vec());
        let mut cursor = &mut stamp;
        for op in path {
            cursor = cursor.add_op(op)?;
        }
        debug_assert_eq!(cursor.msg(), root_msg.as_slice());
        leaves.push(stamp);
    }

    Ok(MerkleTree {
        leaves,
        root_msg,
        level_sizes,
    })
}

impl MerkleTree {
    /// The commitment submitted to calendars.
    pub fn root_msg(&self) -> &[u8] {
        &self.root_msg
    }

    /// A fresh, attestation-less timestamp rooted at the commitment.
    pub fn root_timestamp(&self) -> Timestamp {
        Timestamp::new(self.root_msg.clone())
    }

    /// Number of pairing rounds between the salted leaves and the root.
    pub fn levels(&self) -> usize {
        self.level_sizes.len() - 1
    }

    /// Node count per level, salted leaves first, root last.
    pub fn level_sizes(&self) -> &[usize] {
        &self.level_sizes
    }

    pub fn leaves(&self) -> &[Timestamp] {
        &self.leaves
    }

    /// Grafts the stamped root onto the tip of every leaf path.
    pub fn attach(&mut self, root: &Timestamp) -> Result<(), TimestampError> {
        if root.msg() != self.root_msg.as_slice() {
            return Err(TimestampError::MsgMismatch);
        }
        for leaf in &mut self.leaves {
            let tip = leaf
                .find_mut(&self.root_msg)
                .ok_or(TimestampError::MsgMismatch)?;
            tip.merge(root)?;
        }
        Ok(())
    }

    pub fn into_timestamps(self) -> Vec<Timestamp> {
        self.leaves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ots::attestation::Attestation;
    use sha2::{Digest, Sha256};

    fn digest(n: u8) -> [u8; 32] {
        Sha256::digest([n]).into()
    }

    fn counter_nonces() -> impl FnMut() -> [u8; NONCE_LEN] {
        let mut n = 0u8;
        move || {
            n += 1;
            [n; NONCE_LEN]
        }
    }

    fn path_len(stamp: &Timestamp) -> usize {
        let mut len = 0;
        let mut cursor = stamp;
        while let Some(child) = cursor.ops().values().next() {
            assert_eq!(cursor.ops().len(), 1);
            cursor = child;
            len += 1;
        }
        len
    }

    #[test]
    fn test_single_digest() {
        let tree = make_merkle_tree_with(&[digest(1)], counter_nonces()).unwrap();
        assert_eq!(tree.levels(), 0);
        assert_eq!(tree.leaves().len(), 1);

        let mut salted = digest(1).to_vec();
        salted.extend_from_slice(&[1u8; NONCE_LEN]);
        assert_eq!(tree.root_msg(), Sha256::digest(&salted).as_slice());
        assert_eq!(path_len(&tree.leaves()[0]), 2);
    }

    #[test]
    fn test_three_digests_carry_forward() {
        let tree = make_merkle_tree_with(&[digest(1), digest(2), digest(3)], counter_nonces())
            .unwrap();
        assert_eq!(tree.levels(), 2);
        assert_eq!(tree.level_sizes(), &[3, 2, 1]);

        // the first two are paired twice, the third only at the root
        assert_eq!(path_len(&tree.leaves()[0]), 6);
        assert_eq!(path_len(&tree.leaves()[1]), 6);
        assert_eq!(path_len(&tree.leaves()[2]), 4);

        for leaf in tree.leaves() {
            assert!(leaf.find(tree.root_msg()).is_some());
        }
    }

    #[test]
    fn test_root_matches_manual_computation() {
        let tree = make_merkle_tree_with(&[digest(1), digest(2)], counter_nonces()).unwrap();
        let salt = |d: [u8; 32], n: u8| {
            let mut v = d.to_vec();
            v.extend_from_slice(&[n; NONCE_LEN]);
            Sha256::digest(&v).to_vec()
        };
        let mut concat = salt(digest(1), 1);
        concat.extend(salt(digest(2), 2));
        assert_eq!(tree.root_msg(), Sha256::digest(&concat).as_slice());
    }

    #[test]
    fn test_empty_input_rejected() {
        let empty: [[u8; 32]; 0] = [];
        assert!(matches!(
            make_merkle_tree(&empty),
            Err(TimestampError::EmptyMerkleInput)
        ));
    }

    #[test]
    fn test_random_nonces_differ() {
        let a = make_merkle_tree(&[digest(9)]).unwrap();
        let b = make_merkle_tree(&[digest(9)]).unwrap();
        assert_ne!(a.root_msg(), b.root_msg());
    }

    #[test]
    fn test_attach_and_roundtrip() {
        let digests: Vec<[u8; 32]> = (0..5).map(digest).collect();
        let mut tree = make_merkle_tree(&digests).unwrap();

        let mut root = tree.root_timestamp();
        root.add_attestation(Attestation::Pending {
            uri: "https://alice.example".into(),
        });
        root.add_op(Op::Sha256)
            .unwrap()
            .add_attestation(Attestation::BitcoinBlockHeader { height: 42 });
        tree.attach(&root).unwrap();

        for (leaf, d) in tree.leaves().iter().zip(&digests) {
            assert_eq!(leaf.msg(), d);
            assert_eq!(leaf.all_attestations().len(), 2);
            let bytes = leaf.to_bytes().unwrap();
            let parsed = Timestamp::from_bytes(&bytes, d.to_vec()).unwrap();
            assert_eq!(&parsed, leaf);
        }
    }

    #[test]
    fn test_attach_rejects_foreign_root() {
        let mut tree = make_merkle_tree(&[digest(1)]).unwrap();
        let mut other = Timestamp::new(vec![0u8; 32]);
        other.add_attestation(Attestation::BitcoinBlockHeader { height: 1 });
        assert!(matches!(tree.attach(&other), Err(TimestampError::MsgMismatch)));
    }
}
