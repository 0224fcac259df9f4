//! Pull protocol frames.
//!
//! A request is the path followed by the learner's hash for it:
//!
//! ```text
//! +-----------+------------------+
//! | path: i64 | hash: [u8; 32]   |
//! +-----------+------------------+
//! ```
//!
//! A response always starts with the path and a clean flag. The root
//! response then carries the teacher's leaf range; a dirty leaf carries the
//! leaf payload, with `-1` as the value length of a tombstone:
//!
//! ```text
//! +-----------+-----------+-----------------------------+-----------------------------------------+
//! | path: i64 | clean: u8 | root: first i64, last i64   | dirty leaf: klen i32, key, vlen i32, v  |
//! +-----------+-----------+-----------------------------+-----------------------------------------+
//! ```
//!
//! Whether a payload follows is decided by the receiver's own boundary state,
//! so the root response has to be applied before any other frame is decoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ReconnectError;
use crate::hash::{Hash, HASH_LENGTH};
use crate::leaf::{LeafRecord, MAX_LEAF_KEY_SIZE, MAX_LEAF_VALUE_SIZE};
use crate::path::{Path, TreeBoundaries, INVALID_PATH, ROOT_PATH};

const PATH_LENGTH: usize = size_of::<Path>();
const REQUEST_LENGTH: usize = PATH_LENGTH + HASH_LENGTH;
const TOMBSTONE_LENGTH: i32 = -1;

/// Learner asking whether its node at `path` matches the teacher's.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PullRequest {
    pub path: Path,
    pub hash: Hash,
}

impl PullRequest {
    /// The first request of every session.
    #[must_use]
    pub const fn root() -> Self {
        Self {
            path: ROOT_PATH,
            hash: Hash::EMPTY,
        }
    }

    /// The last request of every session. The teacher acknowledges it and
    /// stops.
    #[must_use]
    pub const fn terminal() -> Self {
        Self {
            path: INVALID_PATH,
            hash: Hash::EMPTY,
        }
    }

    #[must_use]
    pub const fn new(path: Path, hash: Hash) -> Self {
        Self { path, hash }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.path == INVALID_PATH
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_LENGTH);
        buf.put_i64(self.path);
        buf.put_slice(self.hash.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, ReconnectError> {
        if frame.len() != REQUEST_LENGTH {
            return Err(ReconnectError::Malformed("request frame has the wrong length"));
        }

        let path = frame.get_i64();
        let mut hash = [0; HASH_LENGTH];
        frame.copy_to_slice(&mut hash);

        Ok(Self {
            path,
            hash: Hash::new(hash),
        })
    }
}

/// Teacher's verdict on one requested path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PullResponse {
    pub path: Path,
    pub is_clean: bool,
    /// Present iff `path` is the root.
    pub boundaries: Option<TreeBoundaries>,
    /// Present iff the node is a dirty leaf.
    pub leaf: Option<LeafRecord>,
}

impl PullResponse {
    /// Root response; the root is never reported clean.
    #[must_use]
    pub const fn root(boundaries: TreeBoundaries) -> Self {
        Self {
            path: ROOT_PATH,
            is_clean: false,
            boundaries: Some(boundaries),
            leaf: None,
        }
    }

    /// Acknowledgement of the terminal request.
    #[must_use]
    pub const fn terminal_ack() -> Self {
        Self {
            path: INVALID_PATH,
            is_clean: false,
            boundaries: None,
            leaf: None,
        }
    }

    #[must_use]
    pub const fn internal(path: Path, is_clean: bool) -> Self {
        Self {
            path,
            is_clean,
            boundaries: None,
            leaf: None,
        }
    }

    #[must_use]
    pub const fn clean_leaf(path: Path) -> Self {
        Self::internal(path, true)
    }

    #[must_use]
    pub fn dirty_leaf(leaf: LeafRecord) -> Self {
        Self {
            path: leaf.path,
            is_clean: false,
            boundaries: None,
            leaf: Some(leaf),
        }
    }

    #[must_use]
    pub const fn is_terminal_ack(&self) -> bool {
        self.path == INVALID_PATH
    }

    pub fn encode(&self) -> Result<Bytes, ReconnectError> {
        let mut buf = BytesMut::with_capacity(PATH_LENGTH + 1);
        buf.put_i64(self.path);
        buf.put_u8(u8::from(self.is_clean));

        if self.path == ROOT_PATH {
            let boundaries = self.boundaries.unwrap_or_default();
            buf.put_i64(boundaries.first_leaf_path);
            buf.put_i64(boundaries.last_leaf_path);
        }

        if let Some(leaf) = &self.leaf {
            if !leaf.is_valid() {
                return Err(ReconnectError::Malformed("leaf exceeds transfer limits"));
            }
            put_bytes(&mut buf, &leaf.key)?;
            match &leaf.value {
                Some(value) => put_bytes(&mut buf, value)?,
                None => buf.put_i32(TOMBSTONE_LENGTH),
            }
        }

        Ok(buf.freeze())
    }

    /// Decode a response using the receiver's current boundary state.
    pub fn decode(mut frame: Bytes, receiver: &TreeBoundaries) -> Result<Self, ReconnectError> {
        let path = get_i64(&mut frame)?;
        let is_clean = match get_u8(&mut frame)? {
            0 => false,
            1 => true,
            _ => return Err(ReconnectError::Malformed("clean flag is neither 0 nor 1")),
        };

        let mut response = Self::internal(path, is_clean);

        if path == ROOT_PATH {
            let first_leaf_path = get_i64(&mut frame)?;
            let last_leaf_path = get_i64(&mut frame)?;
            response.boundaries = Some(TreeBoundaries::new(first_leaf_path, last_leaf_path)?);
        } else if !is_clean && receiver.is_leaf(path) {
            let key = get_bytes(&mut frame, MAX_LEAF_KEY_SIZE)?
                .ok_or(ReconnectError::Malformed("leaf key cannot be absent"))?;
            let value = get_bytes(&mut frame, MAX_LEAF_VALUE_SIZE)?;
            response.leaf = Some(LeafRecord::new(path, key, value));
        }

        if frame.has_remaining() {
            return Err(ReconnectError::Malformed("trailing bytes after response"));
        }

        Ok(response)
    }
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<(), ReconnectError> {
    let len = i32::try_from(bytes.len())
        .map_err(|_| ReconnectError::Malformed("length does not fit the frame"))?;
    buf.put_i32(len);
    buf.put_slice(bytes);
    Ok(())
}

fn ensure_remaining(frame: &Bytes, len: usize) -> Result<(), ReconnectError> {
    if frame.remaining() < len {
        return Err(ReconnectError::Malformed("truncated frame"));
    }
    Ok(())
}

fn get_i64(frame: &mut Bytes) -> Result<i64, ReconnectError> {
    ensure_remaining(frame, 8)?;
    Ok(frame.get_i64())
}

fn get_u8(frame: &mut Bytes) -> Result<u8, ReconnectError> {
    ensure_remaining(frame, 1)?;
    Ok(frame.get_u8())
}

fn get_bytes(frame: &mut Bytes, limit: usize) -> Result<Option<Vec<u8>>, ReconnectError> {
    ensure_remaining(frame, 4)?;
    let len = frame.get_i32();

    if len == TOMBSTONE_LENGTH {
        return Ok(None);
    }

    let len = usize::try_from(len).map_err(|_| ReconnectError::Malformed("negative length"))?;
    if len > limit {
        return Err(ReconnectError::Malformed("length exceeds transfer limits"));
    }
    ensure_remaining(frame, len)?;

    Ok(Some(frame.split_to(len).to_vec()))
}

#[cfg(test)]
mod tests {
    use claims::{assert_err, assert_matches, assert_ok};

    use super::*;

    fn four_leaves() -> TreeBoundaries {
        TreeBoundaries::for_leaf_count(4)
    }

    #[test]
    fn request_layout() {
        let request = PullRequest::new(5, Hash::new([7; HASH_LENGTH]));
        let frame = request.encode();

        assert_eq!(frame.len(), 40, "path plus hash");
        assert_eq!(&frame[..8], &5_i64.to_be_bytes(), "path first");
        assert_eq!(assert_ok!(PullRequest::decode(frame)), request, "decodes back");

        let short = Bytes::from_static(&[0; 12]);
        let _ = assert_err!(PullRequest::decode(short));
    }

    #[test]
    fn root_response_carries_boundaries() {
        let frame = assert_ok!(PullResponse::root(four_leaves()).encode());
        assert_eq!(frame.len(), 8 + 1 + 16, "path, flag and both boundaries");

        let decoded = assert_ok!(PullResponse::decode(frame, &TreeBoundaries::empty()));
        assert_eq!(decoded.boundaries, Some(four_leaves()), "boundaries survive");
        assert!(!decoded.is_clean, "root is never clean");
    }

    #[test]
    fn invalid_root_boundaries_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i64(ROOT_PATH);
        buf.put_u8(0);
        buf.put_i64(1);
        buf.put_i64(7);

        assert_matches!(
            PullResponse::decode(buf.freeze(), &TreeBoundaries::empty()),
            Err(ReconnectError::InvalidBoundaries { .. })
        );
    }

    #[test]
    fn dirty_leaf_payload_and_tombstone() {
        let leaf = LeafRecord::new(5, b"key".to_vec(), Some(b"value".to_vec()));
        let frame = assert_ok!(PullResponse::dirty_leaf(leaf.clone()).encode());
        let decoded = assert_ok!(PullResponse::decode(frame, &four_leaves()));
        assert_eq!(decoded.leaf, Some(leaf), "payload intact");

        let tombstone = LeafRecord::new(6, b"gone".to_vec(), None);
        let frame = assert_ok!(PullResponse::dirty_leaf(tombstone.clone()).encode());
        let decoded = assert_ok!(PullResponse::decode(frame, &four_leaves()));
        assert_eq!(decoded.leaf, Some(tombstone), "absent value survives");
    }

    #[test]
    fn clean_and_internal_responses_are_bare() {
        for response in [PullResponse::clean_leaf(4), PullResponse::internal(1, false)] {
            let frame = assert_ok!(response.encode());
            assert_eq!(frame.len(), 9, "path and flag only");
            assert_eq!(
                assert_ok!(PullResponse::decode(frame, &four_leaves())),
                response,
                "decodes back"
            );
        }
    }

    #[test]
    fn terminal_ack_decodes_without_boundaries() {
        let frame = assert_ok!(PullResponse::terminal_ack().encode());
        let decoded = assert_ok!(PullResponse::decode(frame, &TreeBoundaries::empty()));
        assert!(decoded.is_terminal_ack(), "ack");
    }

    #[test]
    fn malformed_frames() {
        let leaf = LeafRecord::new(5, b"key".to_vec(), Some(b"value".to_vec()));
        let frame = assert_ok!(PullResponse::dirty_leaf(leaf).encode());

        let truncated = frame.slice(..frame.len() - 2);
        assert_matches!(
            PullResponse::decode(truncated, &four_leaves()),
            Err(ReconnectError::Malformed(_))
        );

        let mut trailing = BytesMut::from(&frame[..]);
        trailing.put_u8(0);
        assert_matches!(
            PullResponse::decode(trailing.freeze(), &four_leaves()),
            Err(ReconnectError::Malformed(_))
        );

        let mut bad_flag = BytesMut::new();
        bad_flag.put_i64(3);
        bad_flag.put_u8(2);
        assert_matches!(
            PullResponse::decode(bad_flag.freeze(), &four_leaves()),
            Err(ReconnectError::Malformed(_))
        );
    }
}
