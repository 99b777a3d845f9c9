pub mod capacity_service;
pub mod job_service;
pub mod package_service;
pub mod vm_service;

#[cfg(test)]
pub mod testing;
