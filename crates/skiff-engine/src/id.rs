use std::fmt;
use std::path::PathBuf;

use tracing::trace;

use crate::error::{EngineError, Result};
use crate::lock;
use crate::paths::ID_LOCK_FILE;
use crate::store::BtrfsStore;

/// Inclusive bounds of the shared numeric identifier pool.
pub const POOL_MIN: u16 = 42;
pub const POOL_MAX: u16 = 254;

/// Random draws attempted before declaring the pool exhausted.
const MAX_DRAWS: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectKind {
    Image,
    Container,
}

impl ObjectKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Image => "img_",
            Self::Container => "ps_",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Container => "container",
        }
    }
}

/// A validated engine identifier: `img_NNN` or `ps_NNN` with `NNN` in
/// `[042, 254]`. The two kinds share the numeric pool but are disjoint by
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectId {
    kind: ObjectKind,
    num: u16,
}

impl ObjectId {
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, body) = if let Some(body) = s.strip_prefix(ObjectKind::Image.prefix()) {
            (ObjectKind::Image, body)
        } else if let Some(body) = s.strip_prefix(ObjectKind::Container.prefix()) {
            (ObjectKind::Container, body)
        } else {
            return None;
        };
        if body.len() != 3 || !body.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let num: u16 = body.parse().ok()?;
        if !(POOL_MIN..=POOL_MAX).contains(&num) {
            return None;
        }
        Some(Self { kind, num })
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    /// The three-digit zero-padded numeric body, e.g. `042`.
    pub fn body(&self) -> String {
        format!("{:03}", self.num)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:03}", self.kind.prefix(), self.num)
    }
}

/// Draw a uniform pool number. UUIDv4 supplies the entropy; the modulo bias
/// over a 213-slot pool is negligible.
fn draw_pool_number() -> u16 {
    let span = u128::from(POOL_MAX - POOL_MIN) + 1;
    let n = uuid::Uuid::new_v4().as_u128() % span;
    POOL_MIN + n as u16
}

/// Mint a fresh identifier of the given kind.
///
/// Draws random candidates and re-checks the store until one is free. An
/// exclusive flock serializes allocation across concurrent invocations so a
/// lost race shows up as an ordinary collision retry.
pub async fn allocate(kind: ObjectKind, store: &BtrfsStore) -> Result<ObjectId> {
    let _guard = lock::acquire(PathBuf::from(ID_LOCK_FILE)).await?;

    for _ in 0..MAX_DRAWS {
        let candidate = ObjectId {
            kind,
            num: draw_pool_number(),
        };
        if store.exists(&candidate.to_string()).await? {
            trace!(id = %candidate, "identifier collision, retrying");
            continue;
        }
        return Ok(candidate);
    }

    Err(EngineError::Precondition(format!(
        "identifier pool exhausted for prefix {}",
        kind.prefix()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_both_kinds() {
        let img = ObjectId::parse("img_042").unwrap();
        assert_eq!(img.kind(), ObjectKind::Image);
        assert_eq!(img.num(), 42);

        let ps = ObjectId::parse("ps_254").unwrap();
        assert_eq!(ps.kind(), ObjectKind::Container);
        assert_eq!(ps.num(), 254);
    }

    #[test]
    fn parse_rejects_out_of_pool_numbers() {
        assert!(ObjectId::parse("img_041").is_none());
        assert!(ObjectId::parse("img_255").is_none());
        assert!(ObjectId::parse("ps_000").is_none());
        assert!(ObjectId::parse("ps_999").is_none());
    }

    #[test]
    fn parse_rejects_malformed_bodies() {
        assert!(ObjectId::parse("img_42").is_none());
        assert!(ObjectId::parse("img_0042").is_none());
        assert!(ObjectId::parse("img_a42").is_none());
        assert!(ObjectId::parse("img_").is_none());
        assert!(ObjectId::parse("vol_100").is_none());
        assert!(ObjectId::parse("").is_none());
    }

    #[test]
    fn display_zero_pads_the_body() {
        let id = ObjectId::parse("img_042").unwrap();
        assert_eq!(id.to_string(), "img_042");
        assert_eq!(id.body(), "042");
    }

    #[test]
    fn display_and_parse_round_trip() {
        for num in POOL_MIN..=POOL_MAX {
            let formatted = format!("ps_{num:03}");
            let id = ObjectId::parse(&formatted).unwrap();
            assert_eq!(id.to_string(), formatted);
        }
    }

    #[test]
    fn kinds_are_disjoint_by_prefix() {
        let img = ObjectId::parse("img_100").unwrap();
        let ps = ObjectId::parse("ps_100").unwrap();
        assert_eq!(img.num(), ps.num());
        assert_ne!(img, ps);
        assert_ne!(img.to_string(), ps.to_string());
    }

    #[test]
    fn draws_stay_inside_the_pool() {
        for _ in 0..10_000 {
            let n = draw_pool_number();
            assert!((POOL_MIN..=POOL_MAX).contains(&n), "out of pool: {n}");
        }
    }

    #[test]
    fn draws_cover_the_pool_bounds() {
        // 10k draws over 213 slots miss a given slot with probability ~4e-21.
        let mut seen_min = false;
        let mut seen_max = false;
        for _ in 0..10_000 {
            match draw_pool_number() {
                POOL_MIN => seen_min = true,
                POOL_MAX => seen_max = true,
                _ => {}
            }
        }
        assert!(seen_min && seen_max);
    }
}
