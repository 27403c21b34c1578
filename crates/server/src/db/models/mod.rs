pub mod host;
pub mod template;
pub mod vm;
pub mod vm_metric;
