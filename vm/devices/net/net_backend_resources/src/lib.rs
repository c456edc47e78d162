// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Resource types shared by network device implementations.

#![forbid(unsafe_code)]

pub mod mac_address;
