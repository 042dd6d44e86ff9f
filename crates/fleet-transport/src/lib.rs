//! fleet-transport: the wire layer of the fleet coordination stack.
//!
//! Defines the `Transport`/`TransportFactory` seam, the JSON-RPC types the
//! MCP transports speak, the concrete MCP and legacy HTTP transports, and
//! the token-bucket rate limiter the executor consults before dispatch.

pub mod jsonrpc;
pub mod legacy;
pub mod mcp;
pub mod rate_limit;
pub mod transport;

pub use rate_limit::{FleetRateLimiter, RateLimitConfig, RateLimitError, RateLimiter};
pub use transport::{Transport, TransportError, TransportFactory, TransportRegistry};
