//! Call-site and function lookups.
//!
//! Both call-site views are pre-sorted in the file, so lookups are plain
//! binary searches. Return-address lookup wants an exact hit (the address a
//! call instruction pushed); a miss is only acceptable for the outermost
//! frame, where the caller falls back to the enclosing-function search.

use crate::metadata::{CallSiteRecord, FunctionRecord, Handle};

impl Handle {
    /// Find the call site whose return address is exactly `addr`.
    pub(crate) fn site_by_addr(&self, addr: u64) -> Option<&CallSiteRecord> {
        let sites = self.sites_by_addr();
        let index = sites.binary_search_by_key(&addr, |s| s.addr.get()).ok()?;
        Some(&sites[index])
    }

    /// Find the call site with ID `id`.
    pub(crate) fn site_by_id(&self, id: u64) -> Option<&CallSiteRecord> {
        let sites = self.sites_by_id();
        let index = sites.binary_search_by_key(&id, |s| s.id.get()).ok()?;
        Some(&sites[index])
    }

    /// Find the function whose `[addr, addr + code_size)` range contains
    /// `pc`, along with its index. Used for the outermost frame only.
    pub(crate) fn function_for_pc(&self, pc: u64) -> Option<(u32, &FunctionRecord)> {
        let functions = self.functions();
        let index = functions.partition_point(|f| f.addr.get() <= pc).checked_sub(1)?;
        let func = &functions[index];
        let end = func.addr.get() + func.code_size.get() as u64;
        if pc < end {
            Some((index as u32, func))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::metadata::Handle;
    use crate::Error;

    // A minimal x86-64 image with two functions and three call sites.
    fn test_handle() -> Handle {
        let mut functions = Vec::new();
        for (addr, code_size) in [(0x1000u64, 0x100u32), (0x2000, 0x80)] {
            functions.extend_from_slice(&addr.to_le_bytes());
            functions.extend_from_slice(&code_size.to_le_bytes());
            functions.extend_from_slice(&0x20u32.to_le_bytes()); // frame_size
            functions.extend_from_slice(&0u32.to_le_bytes()); // unwind_off
            functions.extend_from_slice(&0u16.to_le_bytes()); // unwind_num
            functions.extend_from_slice(&0u32.to_le_bytes()); // stack_slot_off
            functions.extend_from_slice(&0u16.to_le_bytes()); // stack_slot_num
        }

        let site = |id: u64, func_index: u32, addr: u64| {
            let mut out = Vec::new();
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&func_index.to_le_bytes());
            out.push(0);
            out.extend_from_slice(&addr.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out
        };
        let mut by_id = Vec::new();
        let mut by_addr = Vec::new();
        // IDs 3, 7, 9 at addresses 0x1010, 0x2040, 0x1080.
        for (id, func, addr) in [(3u64, 0u32, 0x1010u64), (7, 1, 0x2040), (9, 0, 0x1080)] {
            by_id.extend_from_slice(&site(id, func, addr));
        }
        for (id, func, addr) in [(3u64, 0u32, 0x1010u64), (9, 0, 0x1080), (7, 1, 0x2040)] {
            by_addr.extend_from_slice(&site(id, func, addr));
        }

        let mut obj = object::write::Object::new(
            object::BinaryFormat::Elf,
            object::Architecture::X86_64,
            object::Endianness::Little,
        );
        let mut add = |name: &str, data: Vec<u8>| {
            let id = obj.add_section(
                Vec::new(),
                name.as_bytes().to_vec(),
                object::SectionKind::ReadOnlyData,
            );
            obj.set_section_data(id, data, 1);
        };
        add(".stack_transform.functions", functions);
        add(".stack_transform.unwind", Vec::new());
        add(".stack_transform.id", by_id);
        add(".stack_transform.addr", by_addr);
        add(".stack_transform.live", Vec::new());
        Handle::parse(obj.write().unwrap()).unwrap()
    }

    #[test]
    fn site_lookup_by_id_and_addr() {
        let handle = test_handle();
        assert_eq!(handle.site_by_id(7).unwrap().addr.get(), 0x2040);
        assert_eq!(handle.site_by_id(9).unwrap().func_index.get(), 0);
        assert!(handle.site_by_id(4).is_none());

        assert_eq!(handle.site_by_addr(0x1080).unwrap().id.get(), 9);
        // Exact match only; nearby addresses miss.
        assert!(handle.site_by_addr(0x1081).is_none());
    }

    #[test]
    fn enclosing_function_lookup() {
        let handle = test_handle();
        let (index, func) = handle.function_for_pc(0x10ff).unwrap();
        assert_eq!(index, 0);
        assert_eq!(func.addr.get(), 0x1000);
        assert_eq!(handle.function_for_pc(0x2000).unwrap().0, 1);
        assert!(handle.function_for_pc(0x1100).is_none());
        assert!(handle.function_for_pc(0xfff).is_none());
        assert!(handle.function_for_pc(0x2080).is_none());
    }

    #[test]
    fn missing_section_is_reported() {
        let mut obj = object::write::Object::new(
            object::BinaryFormat::Elf,
            object::Architecture::X86_64,
            object::Endianness::Little,
        );
        let id = obj.add_section(
            Vec::new(),
            b".stack_transform.functions".to_vec(),
            object::SectionKind::ReadOnlyData,
        );
        obj.set_section_data(id, Vec::new(), 1);
        match Handle::parse(obj.write().unwrap()) {
            Err(Error::MissingSection(name)) => assert_eq!(name, ".stack_transform.unwind"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
