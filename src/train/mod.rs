// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Training run: options, loss composition, schedule, session,
//! evaluation and checkpoints.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod pipeline;
pub mod schedule;
pub mod session;
