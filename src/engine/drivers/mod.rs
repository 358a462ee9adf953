// SPDX-License-Identifier: BUSL-1.1

// Backend drivers module

pub mod basex;
pub mod couchdb;
pub mod existdb;
pub mod mongodb;
pub mod xml_rest;
