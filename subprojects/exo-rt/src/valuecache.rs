//! Cached system values.

use exo_svc::mem;
use exo_sys_thread_tls::TLS_SIZE;

/// Values queried once at process init.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ValueCache {
    pub page_size: usize,
    pub log2_page_size: u32,
    pub tls_size: usize,
}

impl ValueCache {
    pub fn query() -> Self {
        let page_size = mem::page_size();
        Self {
            page_size,
            log2_page_size: page_size.trailing_zeros(),
            tls_size: TLS_SIZE,
        }
    }
}
