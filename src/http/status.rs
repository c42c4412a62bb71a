//! Status-code classification for the verb layer.
//!
//! The handful of codes each verb treats specially get a named
//! `TryFromPrimitive` enum so call sites match on an identifier instead
//! of a magic number; everything else falls back to the ordinary 1xx-5xx
//! range check. This is the one place `num_enum` earns its keep in this
//! crate — every other candidate use in the ancestor project never
//! actually matched on raw integers this way.

use num_enum::TryFromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum Known {
    Continue = 100,
    Ok = 200,
    NoContent = 204,
    PartialContent = 206,
    NotModified = 304,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    RangeNotSatisfiable = 416,
    InternalServerError = 500,
    NotImplemented = 501,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
    Unknown,
}

pub fn classify(code: u16) -> Class {
    match code {
        100..=199 => Class::Informational,
        200..=299 => Class::Success,
        300..=399 => Class::Redirection,
        400..=499 => Class::ClientError,
        500..=599 => Class::ServerError,
        _ => Class::Unknown,
    }
}

pub fn known(code: u16) -> Option<Known> {
    Known::try_from(code).ok()
}

/// True for the three statuses GET/HEAD/PUT/DELETE all treat as success.
pub fn is_get_success(code: u16) -> bool {
    matches!(known(code), Some(Known::Ok | Known::NoContent | Known::PartialContent))
}

/// Statuses that permanently mark a verb unsupported for this server
/// (distinct from a transient 5xx retried by the caller).
pub fn marks_verb_unsupported(code: u16) -> bool {
    matches!(
        known(code),
        Some(Known::BadRequest | Known::Forbidden | Known::MethodNotAllowed | Known::NotImplemented)
    ) || code == 500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ranges() {
        assert_eq!(classify(204), Class::Success);
        assert_eq!(classify(404), Class::ClientError);
        assert_eq!(classify(999), Class::Unknown);
    }

    #[test]
    fn get_success_set_matches_spec() {
        assert!(is_get_success(200));
        assert!(is_get_success(204));
        assert!(is_get_success(206));
        assert!(!is_get_success(304));
    }
}
