//! LDAP implementation of the directory contract.
//!
//! Connections are short-lived: each query opens, binds anonymously,
//! searches, and unbinds. Directory traffic is a handful of lookups per
//! reconcile, so connection reuse buys nothing worth the reconnect
//! handling it would need.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ldap3::{ldap_escape, LdapConnAsync, Scope, SearchEntry};
use tracing::{debug, info};

use super::{DirectoryClient, NotFound};
use crate::config::LdapConfig;
use crate::connectors::User;

/// Directory client backed by an LDAP server.
pub struct LdapDirectory {
    config: LdapConfig,
}

impl LdapDirectory {
    /// Create a client for the configured server. The connection itself
    /// is established per query.
    pub fn new(config: LdapConfig) -> Self {
        Self { config }
    }

    async fn search(&self, filter: &str, attrs: Vec<String>) -> Result<Vec<SearchEntry>> {
        let (conn, mut ldap) = LdapConnAsync::new(&self.config.server)
            .await
            .with_context(|| format!("connecting to directory {}", self.config.server))?;
        ldap3::drive!(conn);

        let (entries, _res) = ldap
            .search(&self.config.base_dn, Scope::Subtree, filter, attrs)
            .await
            .context("directory search failed")?
            .success()
            .context("directory search returned an error result")?;

        ldap.unbind().await.ok();

        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }

    fn attr<'a>(entry: &'a SearchEntry, name: &str) -> &'a str {
        entry
            .attrs
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or_default()
    }

    fn user_from_entry(entry: &SearchEntry) -> User {
        let uid = Self::attr(entry, "uid");
        User {
            id: uid.to_owned(),
            email: Self::attr(entry, "mail").to_owned(),
            username: uid.to_owned(),
            first_name: Self::attr(entry, "givenName").to_owned(),
            last_name: Self::attr(entry, "sn").to_owned(),
            display_name: Self::attr(entry, "cn").to_owned(),
            role: String::new(),
        }
    }

    /// Fallback when the uid attribute was not returned: pull it out of
    /// the entry DN.
    fn uid_from_dn(dn: &str) -> Option<String> {
        dn.split(',').find_map(|rdn| {
            let (attr, value) = rdn.split_once('=')?;
            (attr.trim().eq_ignore_ascii_case("uid") && !value.is_empty())
                .then(|| value.to_owned())
        })
    }
}

#[async_trait]
impl DirectoryClient for LdapDirectory {
    async fn get_user_data(&self, identifier: &str) -> Result<User> {
        let filter = self
            .config
            .user_search_filter
            .replace("%s", &ldap_escape(identifier));
        debug!(identifier, %filter, "directory user lookup");

        let attrs = if self.config.attributes.is_empty() {
            vec![
                "uid".to_owned(),
                "mail".to_owned(),
                "cn".to_owned(),
                "sn".to_owned(),
                "givenName".to_owned(),
            ]
        } else {
            self.config.attributes.to_owned()
        };

        let entries = self.search(&filter, attrs).await?;
        let entry = entries
            .first()
            .ok_or_else(|| anyhow!(NotFound).context(format!("user {identifier}")))?;

        Ok(Self::user_from_entry(entry))
    }

    async fn get_query_members(&self, filter: &str) -> Result<Vec<String>> {
        if filter.is_empty() {
            debug!("empty query provided; returning no query members");
            return Ok(Vec::new());
        }

        let entries = self.search(filter, vec!["uid".to_owned()]).await?;
        info!(filter, entries = entries.len(), "directory query results");

        let members = entries
            .iter()
            .filter_map(|entry| {
                let uid = Self::attr(entry, "uid");
                if uid.is_empty() {
                    Self::uid_from_dn(&entry.dn)
                } else {
                    Some(uid.to_owned())
                }
            })
            .collect();
        Ok(members)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uid_from_dn_parses_first_rdn() {
        assert_eq!(
            LdapDirectory::uid_from_dn("uid=alice,ou=users,dc=example,dc=com"),
            Some("alice".to_owned())
        );
        assert_eq!(
            LdapDirectory::uid_from_dn("cn=alice,UID=alice2,ou=users"),
            Some("alice2".to_owned())
        );
        assert_eq!(LdapDirectory::uid_from_dn("cn=alice,ou=users"), None);
    }
}
