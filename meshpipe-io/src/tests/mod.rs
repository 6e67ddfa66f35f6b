//! Cross-format tests for meshpipe-io

pub mod format_dispatch_tests;
