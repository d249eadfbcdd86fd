//! Deterministic cluster object names
//!
//! Names must be valid RFC 1123 labels (lowercase alphanumerics and `-`,
//! starting with a letter, at most 63 characters). When a natural name is not
//! already valid, it is sanitized, truncated, and suffixed with a short hash
//! of the full identity so distinct identities never share a name.

use std::fmt::Write as _;

use uuid::Uuid;

/// Maximum length of a Kubernetes object name used as a DNS label
pub const MAX_LABEL_LEN: usize = 63;

/// Length of the identity hash suffix
const HASH_SUFFIX_LEN: usize = 8;

/// Cluster object names for one container of one project
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceNameSet {
    /// Project namespace
    pub namespace: String,
    /// Workload (Deployment) name
    pub workload: String,
    /// Service name (also the in-cluster DNS host)
    pub service: String,
    /// Ingress name
    pub ingress: String,
    /// Shared volume claim name
    pub volume: String,
}

/// Derives resource names from project identities
pub struct ResourceNamer;

impl ResourceNamer {
    /// Names for a container in a project
    pub fn names(project_id: Uuid, container_name: &str) -> ResourceNameSet {
        let identity = format!("{project_id}/{container_name}");
        ResourceNameSet {
            namespace: Self::namespace(project_id),
            workload: fit_label(container_name, &identity),
            service: fit_label(container_name, &identity),
            ingress: fit_label(
                &format!("{container_name}-route"),
                &format!("{identity}/route"),
            ),
            volume: Self::volume(project_id),
        }
    }

    /// Namespace for a project
    pub fn namespace(project_id: Uuid) -> String {
        format!("proj-{project_id}")
    }

    /// Shared volume claim name for a project
    pub fn volume(project_id: Uuid) -> String {
        format!("ws-{project_id}")
    }

    /// Isolation policy name for a project
    pub fn network_policy(project_id: Uuid) -> String {
        format!("isolate-{}", short_hash(&project_id.to_string()))
    }
}

/// Longest slug that still leaves room for a fitted container label
pub const MAX_SLUG_LEN: usize = MAX_LABEL_LEN - HASH_SUFFIX_LEN - 6;

/// External host for a user-facing container
///
/// `<container>-<slug>.<domain>`. Only the container part is fitted; the
/// slug and domain are kept verbatim so every host of a project ends in
/// `-<slug>.<domain>`, which is what the regional routing rule matches on.
/// Slugs are validated to be labels of at most [`MAX_SLUG_LEN`] characters.
pub fn host_for(slug: &str, container_name: &str, domain: &str) -> String {
    let budget = MAX_LABEL_LEN
        .saturating_sub(slug.len() + 1)
        .max(HASH_SUFFIX_LEN + 2);
    let part = fit_within(
        container_name,
        &format!("host/{slug}/{container_name}"),
        budget,
    );
    format!("{part}-{slug}.{domain}")
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

fn short_hash(input: &str) -> String {
    deterministic_hash(input)[..HASH_SUFFIX_LEN].to_string()
}

/// Lowercase, map invalid characters to `-`, collapse dashes, trim edges
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let c = ch.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        return "c".to_string();
    }
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("c-{trimmed}");
    }
    trimmed.to_string()
}

/// Fit `natural` into a DNS label, keeping it verbatim when already valid
///
/// Any lossy transformation (sanitizing or truncation) appends a hash of
/// `identity`, so two identities that sanitize to the same text still differ.
pub fn fit_label(natural: &str, identity: &str) -> String {
    fit_within(natural, identity, MAX_LABEL_LEN)
}

fn fit_within(natural: &str, identity: &str, max_len: usize) -> String {
    let sanitized = sanitize(natural);
    if sanitized == natural && sanitized.len() <= max_len {
        return sanitized;
    }

    let budget = max_len.saturating_sub(HASH_SUFFIX_LEN + 1).max(1);
    let prefix: String = sanitized.chars().take(budget).collect();
    let prefix = prefix.trim_end_matches('-');
    format!("{}-{}", prefix, short_hash(identity))
}

/// Whether `name` is a valid RFC 1123 label starting with a letter
pub fn is_valid_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_LABEL_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Whether `slug` can be embedded verbatim in project hosts
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
