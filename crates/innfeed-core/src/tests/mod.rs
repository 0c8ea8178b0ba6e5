//! Integration-style tests driving a real loopback socket, grounded on the
//! teacher's `tests::e2e_stream` pattern (spin up a real listener, drive the
//! engine against it, assert on the observed wire traffic).

mod e2e;
