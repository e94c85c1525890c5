// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Writers for the two files the in-container runtime library consumes.
//!
//! `vcuda.config` is a packed, 8-byte-aligned, little-endian record whose
//! layout is fixed by the library; it is written field by field rather
//! than through any compiler-defined struct layout. `pids.config` is a
//! headerless array of 32-bit pids, exclusively flocked during write.

use std::fs::{File, Permissions};
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use bytes::{BufMut, BytesMut};
use fs4::fs_std::FileExt as _;
use vgpu_error::{make_input_err, Error, ResultExt};

const POD_UID_SIZE: usize = 48;
const OCCUPIED_SIZE: usize = 4044;
const CONTAINER_NAME_SIZE: usize = 4096;
const BUS_ID_SIZE: usize = 16;
/// Record size including the trailing alignment padding.
pub const RECORD_SIZE: usize = 8240;

const FILE_MODE: u32 = 0o777;

/// Field values of one `vcuda.config` record.
#[derive(Debug, Clone, Default)]
pub struct VDeviceConfig {
    pub pod_uid: String,
    pub container_name: String,
    pub bus_id: String,
    /// Memory quota in bytes.
    pub gpu_memory: u64,
    /// Compute quota, 0-100.
    pub utilization: u32,
    /// When false, `limit` carries the annotation-supplied cap instead.
    pub hard_limit: bool,
    pub limit: u32,
    pub driver_version: (u32, u32),
    /// False only for containers holding at least one whole card; the
    /// library then leaves the device untouched.
    pub enable: bool,
}

impl VDeviceConfig {
    /// Renders the record. Strings are NUL-terminated in fixed slots;
    /// everything else is little-endian in declaration order.
    pub fn encode(&self) -> Result<BytesMut, Error> {
        let mut buffer = BytesMut::with_capacity(RECORD_SIZE);
        put_fixed_str(&mut buffer, &self.pod_uid, POD_UID_SIZE, "pod uid")?;
        buffer.put_i32_le(self.limit as i32);
        buffer.put_bytes(0, OCCUPIED_SIZE);
        put_fixed_str(
            &mut buffer,
            &self.container_name,
            CONTAINER_NAME_SIZE,
            "container name",
        )?;
        put_fixed_str(&mut buffer, &self.bus_id, BUS_ID_SIZE, "bus id")?;
        buffer.put_u64_le(self.gpu_memory);
        buffer.put_i32_le(self.utilization as i32);
        buffer.put_i32_le(self.hard_limit as i32);
        buffer.put_i32_le(self.driver_version.0 as i32);
        buffer.put_i32_le(self.driver_version.1 as i32);
        buffer.put_i32_le(self.enable as i32);
        // Pad to the 8-byte aligned struct size.
        buffer.put_bytes(0, RECORD_SIZE - buffer.len());
        Ok(buffer)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), Error> {
        let record = self.encode()?;
        let mut file = File::create(path)
            .map_err(Error::from)
            .err_tip(|| format!("while creating {}", path.display()))?;
        file.write_all(&record)
            .map_err(Error::from)
            .err_tip(|| format!("while writing {}", path.display()))?;
        file.set_permissions(Permissions::from_mode(FILE_MODE))
            .map_err(Error::from)
            .err_tip(|| format!("while chmodding {}", path.display()))?;
        Ok(())
    }
}

fn put_fixed_str(
    buffer: &mut BytesMut,
    value: &str,
    size: usize,
    what: &str,
) -> Result<(), Error> {
    let bytes = value.as_bytes();
    // Leave room for the NUL terminator.
    vgpu_error::error_if!(
        bytes.len() >= size,
        "{what} {value:?} does not fit into {size} bytes"
    );
    buffer.put_slice(bytes);
    buffer.put_bytes(0, size - bytes.len());
    Ok(())
}

/// Writes the container's pid list, holding an exclusive flock for the
/// duration so the library never reads a half-written file.
pub fn write_pids_config(path: &Path, pids: &[i32]) -> Result<(), Error> {
    vgpu_error::error_if!(pids.is_empty(), "no pids to write");

    let mut buffer = BytesMut::with_capacity(pids.len() * 4);
    for &pid in pids {
        buffer.put_i32_le(pid);
    }

    let mut file = File::create(path)
        .map_err(Error::from)
        .err_tip(|| format!("while creating {}", path.display()))?;
    file.lock_exclusive()
        .map_err(Error::from)
        .err_tip(|| format!("while locking {}", path.display()))?;
    let written = file
        .write_all(&buffer)
        .map_err(Error::from)
        .err_tip(|| format!("while writing {}", path.display()));
    let unlocked = fs4::fs_std::FileExt::unlock(&file)
        .map_err(Error::from)
        .err_tip(|| format!("while unlocking {}", path.display()));
    written?;
    unlocked?;
    file.set_permissions(Permissions::from_mode(FILE_MODE))
        .map_err(Error::from)
        .err_tip(|| format!("while chmodding {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn read_cstr(record: &[u8], offset: usize, size: usize) -> &str {
        let slot = &record[offset..offset + size];
        let end = slot.iter().position(|&b| b == 0).unwrap();
        core::str::from_utf8(&slot[..end]).unwrap()
    }

    fn read_i32(record: &[u8], offset: usize) -> i32 {
        i32::from_le_bytes(record[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn record_layout_matches_the_library_contract() {
        let config = VDeviceConfig {
            pod_uid: "d98c80af-2009-4eef-9311-71beb2a1a577".to_string(),
            container_name: "cuda-main".to_string(),
            bus_id: "0000:02:00.0".to_string(),
            gpu_memory: 4000 * 1_048_576,
            utilization: 30,
            hard_limit: true,
            limit: 0,
            driver_version: (470, 57),
            enable: true,
        };
        let record = config.encode().unwrap();

        assert_eq!(record.len(), RECORD_SIZE);
        assert_eq!(read_cstr(&record, 0, 48), "d98c80af-2009-4eef-9311-71beb2a1a577");
        assert_eq!(read_i32(&record, 48), 0); // limit
        assert!(record[52..4096].iter().all(|&b| b == 0)); // occupied
        assert_eq!(read_cstr(&record, 4096, 4096), "cuda-main");
        assert_eq!(read_cstr(&record, 8192, 16), "0000:02:00.0");
        assert_eq!(
            u64::from_le_bytes(record[8208..8216].try_into().unwrap()),
            4000 * 1_048_576
        );
        assert_eq!(read_i32(&record, 8216), 30); // utilization
        assert_eq!(read_i32(&record, 8220), 1); // hard_limit
        assert_eq!(read_i32(&record, 8224), 470);
        assert_eq!(read_i32(&record, 8228), 57);
        assert_eq!(read_i32(&record, 8232), 1); // enable
        assert!(record[8236..].iter().all(|&b| b == 0)); // alignment pad
    }

    #[test]
    fn exclusive_allocation_disables_enforcement() {
        let config = VDeviceConfig {
            pod_uid: "pod".to_string(),
            container_name: "whole-card".to_string(),
            bus_id: "0000:03:00.0".to_string(),
            gpu_memory: 16 << 30,
            utilization: 100,
            hard_limit: true,
            limit: 0,
            driver_version: (470, 57),
            enable: false,
        };
        let record = config.encode().unwrap();
        assert_eq!(read_i32(&record, 8232), 0);
    }

    #[test]
    fn annotation_cap_switches_hard_limit_off() {
        let config = VDeviceConfig {
            pod_uid: "pod".to_string(),
            container_name: "capped".to_string(),
            bus_id: "0000:04:00.0".to_string(),
            gpu_memory: 1 << 30,
            utilization: 60,
            hard_limit: false,
            limit: 50,
            driver_version: (470, 57),
            enable: true,
        };
        let record = config.encode().unwrap();
        assert_eq!(read_i32(&record, 48), 50);
        assert_eq!(read_i32(&record, 8220), 0);
    }

    #[test]
    fn oversized_pod_uid_is_rejected() {
        let config = VDeviceConfig {
            pod_uid: "x".repeat(48),
            ..VDeviceConfig::default()
        };
        assert!(config.encode().is_err());
    }

    #[test]
    fn pids_file_is_little_endian_with_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pids.config");
        write_pids_config(&path, &[1, 513, -1]).unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 12);
        assert_eq!(&raw[0..4], &1i32.to_le_bytes());
        assert_eq!(&raw[4..8], &513i32.to_le_bytes());
        assert_eq!(&raw[8..12], &(-1i32).to_le_bytes());

        assert!(write_pids_config(&path, &[]).is_err());
    }
}
