pub mod args;
pub mod run;
pub mod summary;

/// Exit codes for different error conditions
pub mod exit_codes {
    /// Successful execution
    pub const SUCCESS: u8 = 0;
    /// Network/connection error (e.g., host unreachable, connection refused)
    pub const NETWORK_ERROR: u8 = 1;
    /// Authentication error (e.g., broker rejected CONNECT)
    pub const AUTH_ERROR: u8 = 2;
    /// Protocol or iteration errors while connected
    pub const PROTOCOL_ERROR: u8 = 3;
    /// Invalid command line or configuration
    pub const CONFIG_ERROR: u8 = 4;
}
