//! Domain assignment for folders and add-ins.
//!
//! Add-ins in different domains never see each other; the global domain is
//! visible to everyone. Private domains are opaque ids allocated by the
//! registry.

use super::cache::ScanFolderInfo;
use super::registry::AddinRegistry;
use super::session::{ScanSession, SessionDomain};
use super::types::AddinDescriptor;

/// Domain shared by every caller.
pub const GLOBAL_DOMAIN: &str = "global";

/// Placeholder for a domain not yet known.
pub const UNKNOWN_DOMAIN: &str = "unknown";

/// Decide the domain of a folder and update its record.
///
/// `requested` is the domain the caller (or the directory list that led
/// here) asked for; `None` asks for a private domain. Any change that
/// invalidates cross-references sets `regenerate_relation_data`.
pub fn resolve_folder_domain<R: AddinRegistry + ?Sized>(
    folder: &mut ScanFolderInfo,
    requested: Option<&str>,
    is_new: bool,
    registry: &mut R,
    session: &mut ScanSession,
) -> String {
    let requested = if registry.is_global_only() { Some(GLOBAL_DOMAIN) } else { requested };
    let shared = requested == Some(GLOBAL_DOMAIN);

    let domain = if shared {
        if !folder.shared_folder && !is_new {
            session.regenerate_relation_data = true;
        }
        folder.domain = GLOBAL_DOMAIN.to_string();
        GLOBAL_DOMAIN.to_string()
    } else if let Some(requested) = requested {
        if folder.shared_folder || folder.domain != requested {
            folder.domain = requested.to_string();
            if !is_new {
                session.regenerate_relation_data = true;
                session.register_modified_folder(&folder.folder);
            }
        }
        requested.to_string()
    } else if let Some(roots) = folder.roots_domain.clone().filter(|d| is_private(d)) {
        // Non-roots keep the folder domain.
        if folder.shared_folder || !is_private(&folder.domain) {
            allocate_folder_domain(folder, registry, session);
        }
        roots
    } else if !folder.shared_folder && is_private(&folder.domain) {
        folder.domain.clone()
    } else {
        allocate_folder_domain(folder, registry, session)
    };

    if folder.shared_folder != shared {
        session.register_modified_folder(&folder.folder);
    }
    folder.shared_folder = shared;
    domain
}

fn allocate_folder_domain<R: AddinRegistry + ?Sized>(
    folder: &mut ScanFolderInfo,
    registry: &mut R,
    session: &mut ScanSession,
) -> String {
    let domain = registry.allocate_unique_domain_id();
    tracing::debug!(
        folder = %folder.folder.display(),
        domain = %domain,
        "Allocated private domain"
    );
    folder.domain.clone_from(&domain);
    session.regenerate_relation_data = true;
    session.register_modified_folder(&folder.folder);
    domain
}

/// Adopt `domain` as the session domain if none is known yet.
pub fn pin_session_domain(session: &mut ScanSession, domain: &str) {
    session.pin_domain(domain);
}

/// Whether a folder of `domain` must be skipped in this session.
pub fn is_excluded(session: &ScanSession, domain: &str) -> bool {
    session.is_excluded(domain)
}

/// Give a descriptor the domain it belongs to in `folder`.
///
/// Roots get the folder's roots domain, allocated the first time a root is
/// found. Returns `true` if the folder record changed.
pub fn assign_addin_domain<R: AddinRegistry + ?Sized>(
    folder: &mut ScanFolderInfo,
    descriptor: &mut AddinDescriptor,
    session: &ScanSession,
    registry: &mut R,
) -> bool {
    if !descriptor.is_root {
        descriptor.domain.clone_from(&folder.domain);
        return false;
    }

    let mut changed = false;
    let roots = match folder.roots_domain.clone() {
        Some(roots) => roots,
        None => {
            let roots = match &session.domain {
                SessionDomain::Pinned(domain) if is_private(domain) => domain.clone(),
                _ => registry.allocate_unique_domain_id(),
            };
            folder.roots_domain = Some(roots.clone());
            changed = true;
            roots
        }
    };
    descriptor.domain = roots;
    changed
}

fn is_private(domain: &str) -> bool {
    !domain.is_empty() && domain != GLOBAL_DOMAIN && domain != UNKNOWN_DOMAIN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addin::registry::MemoryRegistry;
    use std::path::Path;

    fn folder() -> ScanFolderInfo {
        ScanFolderInfo::new(Path::new("/addins"))
    }

    #[test]
    fn test_shared_folder_is_global() {
        let mut info = folder();
        let mut session = ScanSession::default();
        let mut registry = MemoryRegistry::new();

        let domain = resolve_folder_domain(
            &mut info,
            Some(GLOBAL_DOMAIN),
            true,
            &mut registry,
            &mut session,
        );
        assert_eq!(domain, GLOBAL_DOMAIN);
        assert!(info.shared_folder);
        assert!(!session.regenerate_relation_data);
    }

    #[test]
    fn test_private_to_shared_regenerates() {
        let mut info = folder();
        info.domain = "d1".to_string();
        let mut session = ScanSession::default();
        let mut registry = MemoryRegistry::new();

        resolve_folder_domain(&mut info, Some(GLOBAL_DOMAIN), false, &mut registry, &mut session);
        assert!(session.regenerate_relation_data);
    }

    #[test]
    fn test_new_private_domain_allocated() {
        let mut info = folder();
        let mut session = ScanSession::default();
        let mut registry = MemoryRegistry::new();

        let domain = resolve_folder_domain(&mut info, None, true, &mut registry, &mut session);
        assert_eq!(domain.len(), 32);
        assert_eq!(info.domain, domain);
        assert!(session.regenerate_relation_data);
        assert!(session.modified_folders.contains(Path::new("/addins")));
    }

    #[test]
    fn test_existing_private_domain_reused() {
        let mut info = folder();
        info.domain = "d1".to_string();
        let mut session = ScanSession::default();
        let mut registry = MemoryRegistry::new();

        let domain = resolve_folder_domain(&mut info, None, false, &mut registry, &mut session);
        assert_eq!(domain, "d1");
        assert!(!session.regenerate_relation_data);
        assert!(session.modified_folders.is_empty());
    }

    #[test]
    fn test_roots_domain_reused() {
        let mut info = folder();
        info.domain = "d1".to_string();
        info.roots_domain = Some("roots".to_string());
        let mut session = ScanSession::default();
        let mut registry = MemoryRegistry::new();

        let domain = resolve_folder_domain(&mut info, None, false, &mut registry, &mut session);
        assert_eq!(domain, "roots");
        assert_eq!(info.domain, "d1");
        assert_eq!(info.domain_for(true), "roots");
        assert!(!session.regenerate_relation_data);
        assert!(session.modified_folders.is_empty());
    }

    #[test]
    fn test_roots_domain_without_folder_domain() {
        let mut info = folder();
        info.roots_domain = Some("roots".to_string());
        let mut session = ScanSession::default();
        let mut registry = MemoryRegistry::new();

        let domain = resolve_folder_domain(&mut info, None, false, &mut registry, &mut session);
        assert_eq!(domain, "roots");
        assert_eq!(info.domain.len(), 32);
        assert_ne!(info.domain, "roots");
        assert!(session.modified_folders.contains(Path::new("/addins")));
    }

    #[test]
    fn test_requested_domain_change_regenerates() {
        let mut info = folder();
        info.domain = "d1".to_string();
        let mut session = ScanSession::default();
        let mut registry = MemoryRegistry::new();

        let domain =
            resolve_folder_domain(&mut info, Some("d2"), false, &mut registry, &mut session);
        assert_eq!(domain, "d2");
        assert_eq!(info.domain, "d2");
        assert!(session.regenerate_relation_data);
        assert!(session.modified_folders.contains(Path::new("/addins")));
    }

    #[test]
    fn test_requested_domain_on_new_folder() {
        let mut info = folder();
        let mut session = ScanSession::default();
        let mut registry = MemoryRegistry::new();

        resolve_folder_domain(&mut info, Some("d2"), true, &mut registry, &mut session);
        assert!(!session.regenerate_relation_data);
    }

    #[test]
    fn test_global_only_registry_forces_global() {
        let mut info = folder();
        let mut session = ScanSession::default();
        let mut registry = MemoryRegistry::new().with_global_only(true);

        let domain =
            resolve_folder_domain(&mut info, Some("d1"), true, &mut registry, &mut session);
        assert_eq!(domain, GLOBAL_DOMAIN);
    }

    #[test]
    fn test_root_gets_roots_domain() {
        let mut info = folder();
        info.domain = "d1".to_string();
        let mut registry = MemoryRegistry::new();
        let session = ScanSession::new(SessionDomain::Pinned("d1".to_string()));

        let mut root = AddinDescriptor { is_root: true, ..AddinDescriptor::default() };
        assert!(assign_addin_domain(&mut info, &mut root, &session, &mut registry));
        assert_eq!(root.domain, "d1");

        let mut other = AddinDescriptor { is_root: true, ..AddinDescriptor::default() };
        assert!(!assign_addin_domain(&mut info, &mut other, &session, &mut registry));
        assert_eq!(other.domain, "d1");
    }

    #[test]
    fn test_root_in_global_session_allocates() {
        let mut info = folder();
        info.domain = GLOBAL_DOMAIN.to_string();
        let mut registry = MemoryRegistry::new();
        let session = ScanSession::new(SessionDomain::Pinned(GLOBAL_DOMAIN.to_string()));

        let mut root = AddinDescriptor { is_root: true, ..AddinDescriptor::default() };
        assign_addin_domain(&mut info, &mut root, &session, &mut registry);
        assert_ne!(root.domain, GLOBAL_DOMAIN);
        assert_eq!(info.roots_domain.as_deref(), Some(root.domain.as_str()));

        let mut plain = AddinDescriptor::default();
        assign_addin_domain(&mut info, &mut plain, &session, &mut registry);
        assert_eq!(plain.domain, GLOBAL_DOMAIN);
    }
}
