//! Rerun authorization: who may re-trigger a job.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A team as vended by the membership lookup service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slug: String,
}

/// Membership lookup contract. A nil implementation is permitted and
/// disables the org/team paths.
pub trait RerunAuthLookup {
    fn is_member(&self, org: &str, user: &str) -> Result<bool>;
    fn team_has_member(&self, org: &str, team_id: u64, user: &str) -> Result<bool>;
    fn team_by_slug(&self, slug: &str, org: &str) -> Result<Team>;
}

/// ACL controlling who may re-trigger a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RerunAuthConfig {
    #[serde(default)]
    pub allow_anyone: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub github_users: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub github_orgs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub github_team_ids: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub github_team_slugs: Vec<String>,
}

impl RerunAuthConfig {
    /// Checks, in order: the user allowlist (case-normalized), org
    /// memberships, team-ID memberships, then team slugs (resolved
    /// slug -> ID, then membership). Returns the first true; propagates
    /// any lookup error. A missing lookup service just skips the
    /// org/team paths.
    pub fn is_authorized(
        &self,
        org: &str,
        user: &str,
        lookup: Option<&dyn RerunAuthLookup>,
    ) -> Result<bool> {
        if self.allow_anyone {
            return Ok(true);
        }
        if self
            .github_users
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(user))
        {
            return Ok(true);
        }
        let Some(lookup) = lookup else {
            return Ok(false);
        };
        for github_org in &self.github_orgs {
            if lookup.is_member(github_org, user)? {
                return Ok(true);
            }
        }
        for team_id in &self.github_team_ids {
            if lookup.team_has_member(org, *team_id, user)? {
                return Ok(true);
            }
        }
        for slug in &self.github_team_slugs {
            let team = lookup.team_by_slug(slug, org)?;
            if lookup.team_has_member(org, team.id, user)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// `allow_anyone` and any non-empty allowlist are mutually exclusive.
    pub fn validate(&self) -> Result<(), RerunAuthError> {
        if self.allow_anyone
            && (!self.github_users.is_empty()
                || !self.github_orgs.is_empty()
                || !self.github_team_ids.is_empty()
                || !self.github_team_slugs.is_empty())
        {
            return Err(RerunAuthError::AllowAnyoneWithAllowlist);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RerunAuthError {
    #[error("allow_anyone is mutually exclusive with user/org/team allowlists")]
    AllowAnyoneWithAllowlist,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeLookup {
        org_members: HashMap<String, Vec<String>>,
        team_members: HashMap<u64, Vec<String>>,
        teams_by_slug: HashMap<String, u64>,
    }

    impl RerunAuthLookup for FakeLookup {
        fn is_member(&self, org: &str, user: &str) -> Result<bool> {
            Ok(self
                .org_members
                .get(org)
                .map(|members| members.iter().any(|m| m == user))
                .unwrap_or(false))
        }

        fn team_has_member(&self, _org: &str, team_id: u64, user: &str) -> Result<bool> {
            Ok(self
                .team_members
                .get(&team_id)
                .map(|members| members.iter().any(|m| m == user))
                .unwrap_or(false))
        }

        fn team_by_slug(&self, slug: &str, _org: &str) -> Result<Team> {
            let id = self
                .teams_by_slug
                .get(slug)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no team with slug {slug:?}"))?;
            Ok(Team {
                id,
                name: slug.to_string(),
                slug: slug.to_string(),
            })
        }
    }

    #[test]
    fn test_user_allowlist_without_lookup_service() {
        let config = RerunAuthConfig {
            github_users: vec!["gumby".to_string()],
            ..RerunAuthConfig::default()
        };
        assert!(config.is_authorized("", "gumby", None).unwrap());
        assert!(!config.is_authorized("", "pokey", None).unwrap());
    }

    #[test]
    fn test_user_allowlist_is_case_normalized() {
        let config = RerunAuthConfig {
            github_users: vec!["Gumby".to_string()],
            ..RerunAuthConfig::default()
        };
        assert!(config.is_authorized("", "gumby", None).unwrap());
    }

    #[test]
    fn test_allow_anyone() {
        let config = RerunAuthConfig {
            allow_anyone: true,
            ..RerunAuthConfig::default()
        };
        assert!(config.is_authorized("org", "anybody", None).unwrap());
    }

    #[test]
    fn test_unset_config_denies() {
        let config = RerunAuthConfig::default();
        assert!(!config.is_authorized("org", "user", None).unwrap());
    }

    #[test]
    fn test_org_membership() {
        let mut lookup = FakeLookup::default();
        lookup
            .org_members
            .insert("kubernetes".to_string(), vec!["pokey".to_string()]);
        let config = RerunAuthConfig {
            github_orgs: vec!["kubernetes".to_string()],
            ..RerunAuthConfig::default()
        };
        assert!(config
            .is_authorized("kubernetes", "pokey", Some(&lookup))
            .unwrap());
        assert!(!config
            .is_authorized("kubernetes", "gumby", Some(&lookup))
            .unwrap());
    }

    #[test]
    fn test_team_slug_resolution() {
        let mut lookup = FakeLookup::default();
        lookup.teams_by_slug.insert("sig-testing".to_string(), 99);
        lookup.team_members.insert(99, vec!["pokey".to_string()]);
        let config = RerunAuthConfig {
            github_team_slugs: vec!["sig-testing".to_string()],
            ..RerunAuthConfig::default()
        };
        assert!(config
            .is_authorized("kubernetes", "pokey", Some(&lookup))
            .unwrap());
        // Unknown slug propagates the lookup error.
        let config = RerunAuthConfig {
            github_team_slugs: vec!["missing".to_string()],
            ..RerunAuthConfig::default()
        };
        assert!(config
            .is_authorized("kubernetes", "pokey", Some(&lookup))
            .is_err());
    }

    #[test]
    fn test_missing_lookup_skips_org_and_team_paths() {
        let config = RerunAuthConfig {
            github_orgs: vec!["kubernetes".to_string()],
            github_team_ids: vec![7],
            ..RerunAuthConfig::default()
        };
        assert!(!config.is_authorized("kubernetes", "pokey", None).unwrap());
    }

    #[test]
    fn test_validate_mutual_exclusion() {
        let config = RerunAuthConfig {
            allow_anyone: true,
            github_users: vec!["gumby".to_string()],
            ..RerunAuthConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RerunAuthError::AllowAnyoneWithAllowlist)
        ));
        assert!(RerunAuthConfig::default().validate().is_ok());
    }
}
