//! Authentication, authorization and token issuance.
//!
//! A token request flows through three pluggable stages:
//!
//! - [`authn`] turns credentials into a [`Subject`]
//! - [`authz`] narrows the requested scopes to what the subject may do
//! - [`token`] signs the access token and, when asked, a refresh token
//!
//! [`service::TokenServiceImpl`] chains them into one transaction.

pub mod authn;
pub mod authz;
pub mod scope;
pub mod service;
pub mod subject;
pub mod token;
pub mod users;

pub use authn::{Authenticator, Credential, PasswordAuthenticator, RefreshTokenVerifier, SubjectRepository};
pub use authz::Authorizer;
pub use scope::Scope;
pub use service::{LoggingTokenService, TokenRequest, TokenResponse, TokenService, TokenServiceImpl};
pub use subject::Subject;
pub use token::{AccessTokenIssuer, RefreshTokenIssuer, TokenIssuer};
