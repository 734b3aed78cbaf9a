//! REST client for the rule control API.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{AclApi, AclInfo};
use crate::error::RemoteError;
use crate::rule::{CreateRuleRequest, RemoteRule};

#[derive(Debug, Deserialize)]
struct CreateRuleResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListRulesResponse {
    #[serde(default)]
    rules: Vec<RemoteRule>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(alias = "errortext")]
    message: String,
}

/// Client for a control plane exposing ACL rules over HTTP.
///
/// Routes, relative to the endpoint:
/// - `POST   /acls/{acl}/rules`
/// - `DELETE /rules/{id}`
/// - `GET    /acls/{acl}/rules`
/// - `GET    /acls/{acl}`
#[derive(Debug, Clone)]
pub struct HttpAclClient {
    endpoint: String,
    client: Client,
}

impl HttpAclClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn with_project(request: RequestBuilder, project: Option<&str>) -> RequestBuilder {
        match project {
            Some(project) => request.query(&[("project", project)]),
            None => request,
        }
    }

    async fn send(request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or(body);

        Err(RemoteError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl AclApi for HttpAclClient {
    async fn create_rule(&self, request: &CreateRuleRequest) -> Result<String, RemoteError> {
        debug!(
            "Creating {} rule #{} in ACL {}",
            request.protocol, request.number, request.acl_id
        );
        let url = self.url(&format!("/acls/{}/rules", request.acl_id));
        let response = Self::send(self.client.post(url).json(request)).await?;
        let created: CreateRuleResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        Ok(created.id)
    }

    async fn delete_rule(&self, id: &str) -> Result<(), RemoteError> {
        debug!("Deleting rule {}", id);
        let url = self.url(&format!("/rules/{}", id));
        Self::send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn list_rules(
        &self,
        acl_id: &str,
        project: Option<&str>,
    ) -> Result<Vec<RemoteRule>, RemoteError> {
        debug!("Listing rules of ACL {}", acl_id);
        let url = self.url(&format!("/acls/{}/rules", acl_id));
        let response = Self::send(Self::with_project(self.client.get(url), project)).await?;
        let list: ListRulesResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        Ok(list.rules)
    }

    async fn get_acl(&self, acl_id: &str, project: Option<&str>) -> Result<AclInfo, RemoteError> {
        debug!("Getting ACL {}", acl_id);
        let url = self.url(&format!("/acls/{}", acl_id));
        let response = match Self::send(Self::with_project(self.client.get(url), project)).await {
            Ok(response) => response,
            Err(RemoteError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                return Err(RemoteError::NotFound(format!("ACL {}", acl_id)));
            }
            Err(e) => return Err(e),
        };
        response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}
