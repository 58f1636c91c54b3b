// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod conditions;
mod fail_closed;
mod invalidation;
mod precedence;
mod support;
