use anyhow::Result as AnyResult;

use async_trait::async_trait;

use sled::Transactional;

use snafu::ResultExt;

use crate::node::model::{new_id, Organization};

use super::iface::Flush;
use super::util::{abort, encode, from_tx, get, scan_all};
use super::{DbSnafu, RepositoryError, Result};

const ORGANIZATIONS_TREE: &str = "organizations";
const ORGANIZATIONS_BY_NAME_TREE: &str = "organizations_by_name";

pub trait OrganizationStore: Flush {
    /// Fails with `AlreadyExists` if the name is taken.
    fn add(&self, name: &str) -> Result<Organization>;
    fn get(&self, id: &str) -> Result<Organization>;
    fn find_by_name(&self, name: &str) -> Result<Organization>;
    fn list(&self) -> Result<Vec<Organization>>;
}

pub struct SledOrganizationStore {
    organizations: sled::Tree,
    by_name: sled::Tree,
}

impl SledOrganizationStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            organizations: db.open_tree(ORGANIZATIONS_TREE).context(DbSnafu)?,
            by_name: db.open_tree(ORGANIZATIONS_BY_NAME_TREE).context(DbSnafu)?,
        })
    }
}

#[async_trait]
impl Flush for SledOrganizationStore {
    async fn flush(&self) -> AnyResult<()> {
        self.organizations.flush_async().await?;
        self.by_name.flush_async().await?;
        Ok(())
    }
}

impl OrganizationStore for SledOrganizationStore {
    #[tracing::instrument(name = "organizations.add", level = "debug", skip(self))]
    fn add(&self, name: &str) -> Result<Organization> {
        let org = Organization {
            id: new_id(),
            name: name.into(),
        };
        let encoded = encode(&org)?;

        tokio::task::block_in_place(|| {
            (&self.organizations, &self.by_name).transaction(|(organizations, by_name)| {
                if by_name.get(name.as_bytes())?.is_some() {
                    return abort(Err(RepositoryError::already_exists(format!(
                        "organization '{}'",
                        name
                    ))));
                }
                organizations.insert(org.id.as_bytes(), encoded.as_slice())?;
                by_name.insert(name.as_bytes(), org.id.as_bytes())?;
                Ok(())
            })
        })
        .map_err(from_tx)?;

        Ok(org)
    }

    #[tracing::instrument(name = "organizations.get", level = "debug", skip(self))]
    fn get(&self, id: &str) -> Result<Organization> {
        get(&self.organizations, id.as_bytes())?
            .ok_or_else(|| RepositoryError::not_found(format!("organization '{}'", id)))
    }

    #[tracing::instrument(name = "organizations.find_by_name", level = "debug", skip(self))]
    fn find_by_name(&self, name: &str) -> Result<Organization> {
        let id = tokio::task::block_in_place(|| self.by_name.get(name.as_bytes()))
            .context(DbSnafu)?
            .ok_or_else(|| RepositoryError::not_found(format!("organization '{}'", name)))?;
        get(&self.organizations, &id)?
            .ok_or_else(|| RepositoryError::not_found(format!("organization '{}'", name)))
    }

    #[tracing::instrument(name = "organizations.list", level = "debug", skip(self))]
    fn list(&self) -> Result<Vec<Organization>> {
        let mut orgs: Vec<Organization> = scan_all(&self.organizations)?;
        orgs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(orgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_and_list() -> anyhow::Result<()> {
        let db = sled::Config::new().temporary(true).open()?;
        let store = SledOrganizationStore::new(&db)?;

        let zeta = store.add("zeta-clinic")?;
        let alpha = store.add("alpha-hospital")?;

        assert_eq!(store.get(&zeta.id)?, zeta);
        assert_eq!(store.find_by_name("alpha-hospital")?, alpha);
        assert!(matches!(
            store.add("zeta-clinic"),
            Err(RepositoryError::AlreadyExists { .. })
        ));

        let names: Vec<_> = store.list()?.into_iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["alpha-hospital", "zeta-clinic"]);
        Ok(())
    }
}
