//! GitLab instance entity.
//!
//! Instances are registered by the external management surface; the sync core
//! only reads the base URL and API token.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use url::Url;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "gitlab_instances")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    /// Base URL, e.g. `https://gitlab.example.com`
    #[sea_orm(unique)]
    pub url: String,
    pub api_token: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Host identity used in provenance labels.
    ///
    /// Includes the port when one is set explicitly so two instances on the same
    /// host stay distinguishable.
    pub fn host_identity(&self) -> String {
        match Url::parse(&self.url) {
            Ok(url) => match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{}:{}", host.to_lowercase(), port),
                (Some(host), None) => host.to_lowercase(),
                _ => self.url.trim_end_matches('/').to_lowercase(),
            },
            Err(_) => self.url.trim_end_matches('/').to_lowercase(),
        }
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn instance(url: &str) -> Model {
        let now = Utc::now().fixed_offset();
        Model {
            id: 1,
            name: "test".to_string(),
            url: url.to_string(),
            api_token: "token".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn host_identity_strips_scheme_and_path() {
        assert_eq!(
            instance("https://GitLab.Example.com/").host_identity(),
            "gitlab.example.com"
        );
        assert_eq!(
            instance("http://127.0.0.1:8929").host_identity(),
            "127.0.0.1:8929"
        );
    }
}
