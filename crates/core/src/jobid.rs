//! Job identifier grammar.
//!
//! Minted ids are random UUIDs. Caller-supplied ids must be short
//! alphanumeric tokens so they are always safe as file-name stems.

use uuid::Uuid;

/// Maximum length of a caller-supplied job id.
pub const MAX_JOBID_LEN: usize = 32;

/// A caller-supplied job id that does not satisfy the id grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job id {0:?}: ids must match [A-Za-z0-9_-] and be at most {MAX_JOBID_LEN} characters")]
pub struct InvalidJobId(pub String);

/// Mint a fresh random job id.
pub fn mint_jobid() -> String {
    Uuid::new_v4().to_string()
}

/// Validate a caller-supplied job id.
///
/// Every id must be a non-empty `[A-Za-z0-9_-]` token; the length cap of
/// [`MAX_JOBID_LEN`] is lifted only for the 36-character hyphenated UUID
/// shape that minted ids use. The character class is checked first, so
/// alternate UUID spellings (braced, URN) never slip through as file-name
/// stems.
pub fn validate_jobid(jobid: &str) -> Result<(), InvalidJobId> {
    if jobid.is_empty() {
        return Err(InvalidJobId(jobid.to_string()));
    }
    let ok = jobid
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !ok {
        return Err(InvalidJobId(jobid.to_string()));
    }
    if jobid.len() > MAX_JOBID_LEN && Uuid::parse_str(jobid).is_err() {
        return Err(InvalidJobId(jobid.to_string()));
    }
    Ok(())
}
