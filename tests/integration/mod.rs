//! Integration tests for orgledger
//!
//! The engines run against a real SQLite file with fake outbound adapters;
//! the HTTP adapters are exercised against a mock server.

mod http_adapter_tests;
mod invalidation_tests;
mod membership_tests;
mod organization_tests;
mod overdue_tests;
mod webhook_tests;
