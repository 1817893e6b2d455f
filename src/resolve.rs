use crate::record::Mergeable;

/// Which copy of a record is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
    /// Equal timestamps, or neither side present. No write is issued in
    /// either direction, which is what makes a quiet re-run a no-op. Content
    /// is not compared on ties; two different edits landing on the same
    /// timestamp are masked, a known limitation of whole-record LWW.
    Neither,
}

/// Last-write-wins decision for one logical record. Absent sides lose
/// unconditionally (first-write propagation); otherwise the strictly greater
/// `last_modified` wins. Pure: no clock reads, no store access.
pub fn resolve<M: Mergeable>(local: Option<&M>, remote: Option<&M>) -> Winner {
    match (local, remote) {
        (None, None) => Winner::Neither,
        (Some(_), None) => Winner::Local,
        (None, Some(_)) => Winner::Remote,
        (Some(l), Some(r)) => match l.last_modified().cmp(&r.last_modified()) {
            std::cmp::Ordering::Greater => Winner::Local,
            std::cmp::Ordering::Less => Winner::Remote,
            std::cmp::Ordering::Equal => Winner::Neither,
        },
    }
}
