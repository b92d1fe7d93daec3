use crate::error::Error;
use std::fmt;

/// A 2, 3, or 5-byte vendor gate checked during the STW wake-up handshake (design §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyId(Vec<u8>);

impl CompanyId {
    /// Builds a company ID, rejecting any length other than 2, 3, or 5.
    pub fn new(bytes: impl Into<Vec<u8>>) -> crate::error::Result<Self> {
        let bytes = bytes.into();
        match bytes.len() {
            2 | 3 | 5 => Ok(Self(bytes)),
            n => Err(Error::Range(format!(
                "company ID must be 2, 3, or 5 bytes, got {}",
                n
            ))),
        }
    }

    /// The wildcard company ID that is accepted unconditionally by a server whose
    /// "internal key" flag is set. Design §9 calls for gating its use behind a
    /// constructor parameter rather than a process-wide global; this crate never
    /// had a global to begin with, but it also does not yet implement that gate
    /// anywhere — nothing stops a caller from passing this value. Left as an open
    /// item rather than wired in, since the natural place to enforce it (the
    /// orchestrator, per §9) does not currently sit between the STW client and its
    /// callers for every wake-up path.
    pub fn wildcard() -> Self {
        Self(vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(".")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_lengths_accepted() {
        assert!(CompanyId::new(vec![1, 2]).is_ok());
        assert!(CompanyId::new(vec![1, 2, 3]).is_ok());
        assert!(CompanyId::new(vec![1, 2, 3, 4, 5]).is_ok());
    }

    #[test]
    fn invalid_lengths_rejected() {
        for len in [0, 1, 4, 6, 7] {
            assert!(CompanyId::new(vec![0u8; len]).is_err(), "len {len} should be rejected");
        }
    }

    #[test]
    fn display_is_dotted_hex() {
        let id = CompanyId::new(vec![0x01, 0xAB]).unwrap();
        assert_eq!(id.to_string(), "01.AB");
    }
}
