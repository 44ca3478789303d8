//! CLI subcommands.

#[expect(
    unreachable_pub,
    reason = "binary crate, pub inside private module is fine"
)]
pub mod attestation_time;
#[expect(
    unreachable_pub,
    reason = "binary crate, pub inside private module is fine"
)]
pub mod classify;
