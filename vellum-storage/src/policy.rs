//! Policy Resolver.
//!
//! Reads an object type's descriptor and checks that the version parameters
//! of a call match its caching policy. Every check runs before storage is
//! touched, so a rejected call has no side effects.

use vellum_core::{
    CacheDescriptor, CachePolicy, CacheableObject, Etag, PolicyError, Timestamp, VellumResult,
    VersionParameter,
};

/// Descriptor of `T`, validated.
pub fn describe<T: CacheableObject>() -> VellumResult<CacheDescriptor> {
    Ok(CacheDescriptor::of::<T>()?)
}

fn missing(desc: &CacheDescriptor, parameter: VersionParameter) -> PolicyError {
    PolicyError::MissingParameter {
        type_name: desc.name.to_string(),
        policy: desc.policy,
        parameter,
    }
}

fn unexpected(desc: &CacheDescriptor, parameter: VersionParameter) -> PolicyError {
    PolicyError::UnexpectedParameter {
        type_name: desc.name.to_string(),
        policy: desc.policy,
        parameter,
    }
}

/// Check the version markers of an object write.
pub fn check_write(
    desc: &CacheDescriptor,
    valid_from: Option<Timestamp>,
    etag: Option<&Etag>,
) -> Result<(), PolicyError> {
    match desc.policy {
        CachePolicy::None => {
            if valid_from.is_some() {
                return Err(unexpected(desc, VersionParameter::ValidFrom));
            }
            if etag.is_some() {
                return Err(unexpected(desc, VersionParameter::Etag));
            }
        }
        CachePolicy::ETag => {
            if etag.is_none() {
                return Err(missing(desc, VersionParameter::Etag));
            }
            if valid_from.is_some() {
                return Err(unexpected(desc, VersionParameter::ValidFrom));
            }
        }
        CachePolicy::Timestamp => {
            if valid_from.is_none() {
                return Err(missing(desc, VersionParameter::ValidFrom));
            }
            if etag.is_some() {
                return Err(unexpected(desc, VersionParameter::Etag));
            }
        }
    }
    Ok(())
}

/// Check the version markers of a collection snapshot.
///
/// Timestamp snapshots carry an ETag as well, so that later as-of queries
/// can prove the collection unchanged between two snapshots.
pub fn check_collect(
    desc: &CacheDescriptor,
    valid_at: Option<Timestamp>,
    etag: Option<&Etag>,
) -> Result<(), PolicyError> {
    match desc.policy {
        CachePolicy::None => Err(PolicyError::CollectionUnsupported {
            type_name: desc.name.to_string(),
        }),
        CachePolicy::ETag => {
            if etag.is_none() {
                return Err(missing(desc, VersionParameter::Etag));
            }
            if valid_at.is_some() {
                return Err(unexpected(desc, VersionParameter::ValidAt));
            }
            Ok(())
        }
        CachePolicy::Timestamp => {
            if valid_at.is_none() {
                return Err(missing(desc, VersionParameter::ValidAt));
            }
            if etag.is_none() {
                return Err(missing(desc, VersionParameter::Etag));
            }
            Ok(())
        }
    }
}

/// Check the selectors of a collection read.
pub fn check_collection_read(
    desc: &CacheDescriptor,
    at: Option<Timestamp>,
) -> Result<(), PolicyError> {
    match desc.policy {
        CachePolicy::None => Err(PolicyError::CollectionUnsupported {
            type_name: desc.name.to_string(),
        }),
        CachePolicy::ETag if at.is_some() => Err(unexpected(desc, VersionParameter::At)),
        CachePolicy::ETag | CachePolicy::Timestamp => Ok(()),
    }
}
