// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

//! A TLS-tunneled relay server.
//!
//! Clients that present a valid credential in the first plaintext bytes of a
//! TLS session get tunneled to an arbitrary target; everyone else (wrong
//! credential, malformed framing, a plain browser poking at the port) is
//! transparently spliced to a fallback origin, so the two cases are
//! indistinguishable from the network.
pub mod config;
pub mod proto;
pub mod server;
pub mod session;
