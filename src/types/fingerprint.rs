use crate::error::Error;

/// Maximum length of the fingerprint username field (design §3).
pub const MAX_USERNAME_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintDate {
    pub year: u8,
    pub month: u8,
    pub day: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Which fingerprint sub-fields a server actually implements, read from the
/// "supported indexes" query (design §4.1 capability cascade, step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupportedFingerprintFields {
    pub date: bool,
    pub time: bool,
    pub username: bool,
    pub application_checksum: bool,
}

/// On-device record of who/when programmed the application, plus an application
/// checksum (design glossary). Each field is only `Some` if the server reported
/// the corresponding sub-service as supported.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fingerprint {
    pub date: Option<FingerprintDate>,
    pub time: Option<FingerprintTime>,
    pub username: Option<String>,
    pub application_checksum: Option<u32>,
}

impl Fingerprint {
    pub fn with_username(mut self, username: impl Into<String>) -> crate::error::Result<Self> {
        let username = username.into();
        if username.len() > MAX_USERNAME_LEN {
            return Err(Error::Range(format!(
                "fingerprint username longer than {} characters",
                MAX_USERNAME_LEN
            )));
        }
        self.username = Some(username);
        Ok(self)
    }

    /// Masks out fields the server does not support, so only valid fields remain set.
    pub fn masked(mut self, supported: SupportedFingerprintFields) -> Self {
        if !supported.date {
            self.date = None;
        }
        if !supported.time {
            self.time = None;
        }
        if !supported.username {
            self.username = None;
        }
        if !supported.application_checksum {
            self.application_checksum = None;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_over_limit_rejected() {
        let fp = Fingerprint::default();
        assert!(fp.with_username("x".repeat(21)).is_err());
        let fp = Fingerprint::default();
        assert!(fp.with_username("x".repeat(20)).is_ok());
    }

    #[test]
    fn masking_drops_unsupported_fields() {
        let fp = Fingerprint {
            date: Some(FingerprintDate {
                year: 24,
                month: 1,
                day: 1,
            }),
            time: Some(FingerprintTime {
                hour: 12,
                minute: 0,
                second: 0,
            }),
            username: Some("alice".into()),
            application_checksum: Some(0xDEAD_BEEF),
        };
        let masked = fp.masked(SupportedFingerprintFields {
            date: true,
            time: false,
            username: false,
            application_checksum: true,
        });
        assert!(masked.date.is_some());
        assert!(masked.time.is_none());
        assert!(masked.username.is_none());
        assert!(masked.application_checksum.is_some());
    }
}
