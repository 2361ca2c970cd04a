// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

#[allow(unused_imports)]
pub(crate) use crate::observability::{
    log_debug as debug, log_error as error, log_info as info, log_warn as warn,
};
