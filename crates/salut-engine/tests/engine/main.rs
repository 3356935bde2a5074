//! Engine integration tests.
//!
//! Two (or more) in-process services talk over localhost TCP. Discovery
//! runs through an in-process hub double, so tests need no multicast and
//! no real mDNS daemon — the session layer under test is exactly the one
//! used in production.

mod support;

mod concurrent;
mod discovery;
mod idle;
mod messaging;
