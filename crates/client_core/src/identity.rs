//! Canonicalization of peer references.
//!
//! A peer can reach the client as an opaque member id, as an address, or
//! only as an address embedded in a display string such as
//! `"Doe Jane <jane@x.com>"`. Everything downstream compares [`PeerKey`]s, so
//! every raw reference goes through this module exactly once.

use std::collections::HashMap;

use shared::{domain::PeerKey, protocol::MemberSummary};

/// Trims and lowercases; `None` and blank input give the empty key.
pub fn normalize(raw: Option<&str>) -> PeerKey {
    raw.map(PeerKey::normalize).unwrap_or_default()
}

pub fn embedded_address(display_name: &str) -> Option<&str> {
    let start = display_name.rfind('<')?;
    let rest = &display_name[start + 1..];
    let end = rest.find('>')?;
    let address = rest[..end].trim();
    (!address.is_empty()).then_some(address)
}

pub fn strip_embedded_address(display_name: &str) -> &str {
    match display_name.find('<') {
        Some(start) => display_name[..start].trim(),
        None => display_name.trim(),
    }
}

/// Canonical key of a directory row: its address, else the address embedded
/// in its display name, else its opaque id.
pub fn member_key(member: &MemberSummary) -> PeerKey {
    let address = PeerKey::normalize(&member.address);
    if !address.is_empty() {
        return address;
    }
    let embedded = normalize(embedded_address(&member.display_name));
    if !embedded.is_empty() {
        return embedded;
    }
    PeerKey::normalize(&member.id)
}

/// Resolves a peer reference, trying in order: the raw identifier (mapped
/// through the member set when it is an opaque member id), an address
/// embedded in the display name, and, only when `is_self` is set, the
/// caller's own identity followed by the self row of the member set.
///
/// Both self fallbacks, the configured identity and the self row, sit behind
/// `is_self`: a lookup for someone else that fails resolves to the empty key,
/// never to self. Callers must refuse to address an empty key.
pub fn resolve_peer(
    candidate: Option<&str>,
    display_name: Option<&str>,
    is_self: bool,
    current_user: Option<&str>,
    members: &[MemberSummary],
) -> PeerKey {
    if let Some(raw) = candidate.map(str::trim).filter(|raw| !raw.is_empty()) {
        return match members.iter().find(|member| member.id.trim() == raw) {
            Some(member) => member_key(member),
            None => PeerKey::normalize(raw),
        };
    }

    let embedded = normalize(display_name.and_then(embedded_address));
    if !embedded.is_empty() {
        return embedded;
    }

    if !is_self {
        return PeerKey::empty();
    }

    let current = normalize(current_user);
    if !current.is_empty() {
        return current;
    }

    members
        .iter()
        .find(|member| member.is_self)
        .map(member_key)
        .unwrap_or_default()
}

/// The loaded member set of a tenant, indexed for boundary resolution.
#[derive(Debug, Clone, Default)]
pub struct MemberDirectory {
    members: Vec<MemberSummary>,
    by_id: HashMap<String, PeerKey>,
    display_names: HashMap<PeerKey, String>,
}

impl MemberDirectory {
    pub fn new(members: Vec<MemberSummary>) -> Self {
        let mut by_id = HashMap::new();
        let mut display_names = HashMap::new();
        for member in &members {
            let key = member_key(member);
            if key.is_empty() {
                continue;
            }
            let id = member.id.trim();
            if !id.is_empty() {
                by_id.insert(id.to_string(), key.clone());
            }
            let name = strip_embedded_address(&member.display_name);
            if !name.is_empty() {
                display_names.insert(key, name.to_string());
            }
        }
        Self {
            members,
            by_id,
            display_names,
        }
    }

    pub fn members(&self) -> &[MemberSummary] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn canonical(&self, raw: &str) -> PeerKey {
        match self.by_id.get(raw.trim()) {
            Some(key) => key.clone(),
            None => PeerKey::normalize(raw),
        }
    }

    pub fn self_key(&self) -> PeerKey {
        self.members
            .iter()
            .find(|member| member.is_self)
            .map(member_key)
            .unwrap_or_default()
    }

    pub fn display_name(&self, key: &PeerKey) -> Option<&str> {
        self.display_names.get(key).map(String::as_str)
    }

    pub fn resolve(
        &self,
        candidate: Option<&str>,
        display_name: Option<&str>,
        is_self: bool,
        current_user: Option<&str>,
    ) -> PeerKey {
        resolve_peer(candidate, display_name, is_self, current_user, &self.members)
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
