// Layered configuration (TOML file + environment)
pub mod config;

// Encrypted session and credential storage
pub mod vault;

// OAuth authorization-code login and token endpoint client
pub mod oauth;

// Token refresh with retry
pub mod refresh;
