//! OS version to repository variant resolution.

use crate::config::RepositoryConfig;
use log::debug;

/// Codename a repository uses for `version`, if it maps that version at all.
pub fn resolve_codename<'a>(repository: &'a RepositoryConfig, version: &str) -> Option<&'a str> {
    repository.codename_for(version)
}

/// Picks the repository serving `provider` on `os` `version`.
///
/// Repositories named `{provider}-{os}-{codename}` win. Failing that, the first
/// repository whose name contains both the provider and the codename is taken,
/// which can pick the wrong family when two distributions share a version and
/// codename. Without an OS and version, or without any match, the bare provider
/// name is returned.
pub fn resolve_repository_name<'a, I>(
    provider: &str,
    os: Option<&str>,
    version: Option<&str>,
    repositories: I,
) -> String
where
    I: IntoIterator<Item = &'a RepositoryConfig>,
{
    let (os, version) = match (os, version) {
        (Some(os), Some(version)) => (os, version),
        _ => return provider.to_string(),
    };

    let candidates: Vec<(&RepositoryConfig, &str)> = repositories
        .into_iter()
        .filter(|repo| repo.repo_type == provider)
        .filter_map(|repo| resolve_codename(repo, version).map(|codename| (repo, codename)))
        .collect();

    for (repo, codename) in &candidates {
        if repo.name == format!("{}-{}-{}", provider, os, codename) {
            debug!("Resolved {} {} {} to {}", provider, os, version, repo.name);
            return repo.name.clone();
        }
    }

    for (repo, codename) in &candidates {
        if repo.name.contains(provider) && repo.name.contains(codename) {
            debug!(
                "Resolved {} {} {} to {} by name match",
                provider, os, version, repo.name
            );
            return repo.name.clone();
        }
    }

    debug!(
        "No {} repository for {} {}, using generic name",
        provider, os, version
    );
    provider.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoints, ParsingConfig, Platform, QueryType};
    use std::collections::BTreeMap;

    fn repo(name: &str, repo_type: &str, mapping: &[(&str, &str)]) -> RepositoryConfig {
        RepositoryConfig {
            name: name.to_string(),
            repo_type: repo_type.to_string(),
            platform: Platform::Linux,
            enabled: true,
            priority: 0,
            eol: false,
            query_type: QueryType::BulkDownload,
            endpoints: Endpoints {
                packages: Some("https://example.com/Packages".to_string()),
                ..Default::default()
            },
            parsing: ParsingConfig {
                format: "debian_packages".to_string(),
                ..Default::default()
            },
            version_mapping: if mapping.is_empty() {
                None
            } else {
                Some(
                    mapping
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                )
            },
            limits: None,
            auth: None,
            description: None,
            architecture: None,
            cache: None,
        }
    }

    #[test]
    fn test_resolve_codename_for_every_mapped_version() {
        let jammy = repo(
            "apt-ubuntu-jammy",
            "apt",
            &[("22.04", "jammy"), ("22.04.4", "jammy")],
        );
        for (version, codename) in jammy.version_mapping.clone().unwrap() {
            assert_eq!(resolve_codename(&jammy, &version), Some(codename.as_str()));
        }
        assert_eq!(resolve_codename(&jammy, "99.04"), None);
        assert_eq!(resolve_codename(&repo("npm", "npm", &[]), "22.04"), None);
    }

    #[test]
    fn test_canonical_name_is_resolved() {
        let repos = vec![
            repo("apt-ubuntu-focal", "apt", &[("20.04", "focal")]),
            repo("apt-ubuntu-jammy", "apt", &[("22.04", "jammy")]),
        ];
        assert_eq!(
            resolve_repository_name("apt", Some("ubuntu"), Some("22.04"), &repos),
            "apt-ubuntu-jammy"
        );
    }

    #[test]
    fn test_missing_os_or_version_returns_provider() {
        let repos = vec![repo("apt-ubuntu-jammy", "apt", &[("22.04", "jammy")])];
        assert_eq!(resolve_repository_name("apt", None, None, &repos), "apt");
        assert_eq!(
            resolve_repository_name("apt", Some("ubuntu"), None, &repos),
            "apt"
        );
        assert_eq!(
            resolve_repository_name("apt", None, Some("22.04"), &repos),
            "apt"
        );
    }

    #[test]
    fn test_unknown_version_falls_back_to_provider() {
        let repos = vec![repo("apt-ubuntu-jammy", "apt", &[("22.04", "jammy")])];
        assert_eq!(
            resolve_repository_name("apt", Some("ubuntu"), Some("18.04"), &repos),
            "apt"
        );
    }

    #[test]
    fn test_substring_fallback_for_non_canonical_names() {
        let repos = vec![repo("ubuntu-jammy-apt-main", "apt", &[("22.04", "jammy")])];
        assert_eq!(
            resolve_repository_name("apt", Some("ubuntu"), Some("22.04"), &repos),
            "ubuntu-jammy-apt-main"
        );
    }

    #[test]
    fn test_canonical_match_beats_earlier_substring_match() {
        let repos = vec![
            repo("dnf-rocky-9", "dnf", &[("9", "9")]),
            repo("dnf-alma-9", "dnf", &[("9", "9")]),
        ];
        assert_eq!(
            resolve_repository_name("dnf", Some("alma"), Some("9"), &repos),
            "dnf-alma-9"
        );
    }

    #[test]
    fn test_shared_codenames_can_pick_the_wrong_family() {
        // known limitation of the substring fallback
        let repos = vec![
            repo("rocky9-dnf", "dnf", &[("9", "9")]),
            repo("alma9-dnf", "dnf", &[("9", "9")]),
        ];
        assert_eq!(
            resolve_repository_name("dnf", Some("alma"), Some("9"), &repos),
            "rocky9-dnf"
        );
    }

    #[test]
    fn test_other_provider_types_are_ignored() {
        let repos = vec![repo("apt-ubuntu-jammy", "apt", &[("22.04", "jammy")])];
        assert_eq!(
            resolve_repository_name("snap", Some("ubuntu"), Some("22.04"), &repos),
            "snap"
        );
    }
}
