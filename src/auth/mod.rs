//! Credential providers for the Bitbucket and SonarCloud APIs.

use crate::client::ApiTarget;
use crate::errors::{ApiError, ApiResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::HeaderValue;
use secrecy::{ExposeSecret, SecretString};

/// Authentication method attached to outgoing requests.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Bearer token (repository/workspace access token, SonarCloud token).
    Bearer(SecretString),
    /// Username and app password.
    Basic {
        /// Account username.
        username: String,
        /// App password.
        password: SecretString,
    },
}

impl AuthMethod {
    /// Creates a bearer token method.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(SecretString::new(token.into()))
    }

    /// Creates a username/app-password method.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Renders the `Authorization` header value.
    pub fn header_value(&self) -> ApiResult<HeaderValue> {
        let raw = match self {
            Self::Bearer(token) => format!("Bearer {}", token.expose_secret()),
            Self::Basic { username, password } => {
                let pair = format!("{}:{}", username, password.expose_secret());
                format!("Basic {}", STANDARD.encode(pair))
            }
        };

        let mut value = HeaderValue::from_str(&raw).map_err(|e| {
            ApiError::authentication("Credential contains invalid header characters").with_cause(e)
        })?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Short label safe for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Bearer(_) => "bearer ***".to_string(),
            Self::Basic { username, .. } => format!("basic {}:***", username),
        }
    }
}

/// Supplies credentials for outgoing requests.
///
/// Acquiring or refreshing tokens is outside this crate; a provider only
/// reports what it currently holds and whether that is usable.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Gets the authentication method for the given API.
    async fn auth_method(&self, target: ApiTarget) -> ApiResult<AuthMethod>;

    /// Checks if usable credentials are held for the given API.
    async fn is_valid(&self, target: ApiTarget) -> bool;
}

/// Static credential provider using fixed credentials.
pub struct StaticCredentialProvider {
    pipelines: AuthMethod,
    analysis: Option<AuthMethod>,
}

impl StaticCredentialProvider {
    /// Creates a provider that uses one method for every API.
    pub fn new(method: AuthMethod) -> Self {
        Self {
            pipelines: method,
            analysis: None,
        }
    }

    /// Uses a separate method for the analysis API.
    pub fn with_analysis(mut self, method: AuthMethod) -> Self {
        self.analysis = Some(method);
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn auth_method(&self, target: ApiTarget) -> ApiResult<AuthMethod> {
        match target {
            ApiTarget::Pipelines => Ok(self.pipelines.clone()),
            ApiTarget::Analysis => Ok(self
                .analysis
                .clone()
                .unwrap_or_else(|| self.pipelines.clone())),
        }
    }

    async fn is_valid(&self, _target: ApiTarget) -> bool {
        true
    }
}

/// Environment variable credential provider.
///
/// Bitbucket credentials come from `BITBUCKET_TOKEN`, or from
/// `BITBUCKET_USERNAME` with `BITBUCKET_APP_PASSWORD`. SonarCloud uses
/// `SONAR_TOKEN`.
pub struct EnvCredentialProvider {
    token_var: String,
    username_var: String,
    password_var: String,
    analysis_token_var: String,
}

impl EnvCredentialProvider {
    /// Creates a provider reading the standard variables.
    pub fn new() -> Self {
        Self {
            token_var: "BITBUCKET_TOKEN".to_string(),
            username_var: "BITBUCKET_USERNAME".to_string(),
            password_var: "BITBUCKET_APP_PASSWORD".to_string(),
            analysis_token_var: "SONAR_TOKEN".to_string(),
        }
    }

    /// Overrides the bearer token variable name.
    pub fn with_token_var(mut self, var_name: impl Into<String>) -> Self {
        self.token_var = var_name.into();
        self
    }

    /// Overrides the username/app-password variable names.
    pub fn with_basic_vars(
        mut self,
        username_var: impl Into<String>,
        password_var: impl Into<String>,
    ) -> Self {
        self.username_var = username_var.into();
        self.password_var = password_var.into();
        self
    }

    /// Overrides the SonarCloud token variable name.
    pub fn with_analysis_token_var(mut self, var_name: impl Into<String>) -> Self {
        self.analysis_token_var = var_name.into();
        self
    }

    fn analysis_method(&self) -> Option<AuthMethod> {
        std::env::var(&self.analysis_token_var)
            .ok()
            .filter(|t| !t.is_empty())
            .map(AuthMethod::bearer)
    }

    fn pipelines_method(&self) -> Option<AuthMethod> {
        if let Ok(token) = std::env::var(&self.token_var) {
            if !token.is_empty() {
                return Some(AuthMethod::bearer(token));
            }
        }
        match (
            std::env::var(&self.username_var),
            std::env::var(&self.password_var),
        ) {
            (Ok(user), Ok(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some(AuthMethod::basic(user, pass))
            }
            _ => None,
        }
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn auth_method(&self, target: ApiTarget) -> ApiResult<AuthMethod> {
        match target {
            ApiTarget::Pipelines => self.pipelines_method().ok_or_else(|| {
                ApiError::authentication(format!(
                    "Neither {} nor {}/{} is set",
                    self.token_var, self.username_var, self.password_var
                ))
            }),
            ApiTarget::Analysis => self.analysis_method().ok_or_else(|| {
                ApiError::authentication(format!(
                    "Environment variable {} not set",
                    self.analysis_token_var
                ))
            }),
        }
    }

    async fn is_valid(&self, target: ApiTarget) -> bool {
        match target {
            ApiTarget::Pipelines => self.pipelines_method().is_some(),
            ApiTarget::Analysis => self.analysis_method().is_some(),
        }
    }
}
