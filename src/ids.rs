//! ID allocators: pseudo-UIDs, TS6-style UIDs, and virtual-server SIDs.

/// Allocates pseudo-UIDs of the form `origin@counter`.
///
/// PUIDs stand in for real UIDs in two places: virtual clients spawned
/// before the uplink has assigned anything, and users on legacy
/// protocols that never assign UIDs at all. Uniqueness is only needed
/// within one network's lifetime, so a plain counter suffices.
#[derive(Debug)]
pub struct PuidGenerator {
    namespace: String,
    counter: u64,
}

impl PuidGenerator {
    /// `namespace` is used as the origin when the caller has none.
    pub fn new(namespace: &str) -> Self {
        Self { namespace: namespace.to_string(), counter: 0 }
    }

    /// Produce the next PUID for the given origin (typically a nick).
    pub fn next(&mut self, origin: &str) -> String {
        let origin = if origin.is_empty() { &self.namespace } else { origin };
        let puid = format!("{}@{}", origin, self.counter);
        self.counter += 1;
        puid
    }
}

/// Allocates TS6-format UIDs: a 3-char SID plus a 6-char base36 suffix.
#[derive(Debug)]
pub struct UidGenerator {
    sid: String,
    counter: u64,
}

impl UidGenerator {
    pub fn new(sid: &str) -> Self {
        Self { sid: sid.to_string(), counter: 0 }
    }

    pub fn next(&mut self) -> String {
        let uid = format!("{}{}", self.sid, base36_suffix(self.counter));
        self.counter += 1;
        uid
    }
}

/// Encode a counter as the 6-character `A..9` suffix of a TS6 UID.
fn base36_suffix(mut n: u64) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut out = [b'A'; 6];
    for slot in out.iter_mut().rev() {
        *slot = CHARS[(n % 36) as usize];
        n /= 36;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Allocates SIDs for virtual sub-servers from a `sidrange` template.
///
/// The template fixes some characters and marks free positions with `#`,
/// e.g. `8##` yields `8AA`, `8AB`, ... Exhausting the range returns
/// `None`; the caller surfaces that as a spawn failure.
#[derive(Debug)]
pub struct SidGenerator {
    template: String,
    counter: u64,
    capacity: u64,
}

impl SidGenerator {
    pub fn new(template: &str) -> Self {
        let wildcards = template.chars().filter(|&c| c == '#').count() as u32;
        Self {
            template: template.to_string(),
            counter: 0,
            capacity: 36u64.saturating_pow(wildcards),
        }
    }

    pub fn next(&mut self) -> Option<String> {
        if self.counter >= self.capacity {
            return None;
        }

        const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut n = self.counter;
        self.counter += 1;

        // Fill wildcard positions right-to-left with base36 digits.
        let mut out: Vec<u8> = self.template.bytes().collect();
        for b in out.iter_mut().rev() {
            if *b == b'#' {
                *b = CHARS[(n % 36) as usize];
                n /= 36;
            }
        }
        Some(String::from_utf8_lossy(&out).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn puids_count_up_per_generator() {
        let mut gen = PuidGenerator::new("PUID");
        assert_eq!(gen.next("GL"), "GL@0");
        assert_eq!(gen.next("GL"), "GL@1");
        assert_eq!(gen.next("Global"), "Global@2");
        assert_eq!(gen.next(""), "PUID@3");
    }

    #[test]
    fn uids_use_base36_suffixes() {
        let mut gen = UidGenerator::new("42X");
        assert_eq!(gen.next(), "42XAAAAAA");
        assert_eq!(gen.next(), "42XAAAAAB");
        for _ in 0..34 {
            gen.next();
        }
        assert_eq!(gen.next(), "42XAAAABA");
    }

    #[test]
    fn sid_template_fills_wildcards() {
        let mut gen = SidGenerator::new("8##");
        assert_eq!(gen.next().as_deref(), Some("8AA"));
        assert_eq!(gen.next().as_deref(), Some("8AB"));
    }

    #[test]
    fn sid_range_exhausts() {
        let mut gen = SidGenerator::new("97#");
        for _ in 0..36 {
            assert!(gen.next().is_some());
        }
        assert_eq!(gen.next(), None);
    }

    #[test]
    fn fixed_template_yields_exactly_one() {
        let mut gen = SidGenerator::new("9PZ");
        assert_eq!(gen.next().as_deref(), Some("9PZ"));
        assert_eq!(gen.next(), None);
    }
}
