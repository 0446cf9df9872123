//! Bitmap allocator for small integer ids (containers, volumes, NAT offsets).

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug)]
pub struct IdMap {
    base: u32,
    used: Vec<bool>,
}

impl IdMap {
    /// Ids are handed out from `base` to `base + size - 1` inclusive.
    pub fn new(base: u32, size: u32) -> Self {
        IdMap {
            base,
            used: vec![false; size as usize],
        }
    }

    /// Claim a specific id, e.g. when restoring from the persistent store.
    pub fn get_at(&mut self, id: u32) -> Result<()> {
        let idx = self.index(id)?;
        if self.used[idx] {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("id {} already used", id),
            ));
        }
        self.used[idx] = true;
        Ok(())
    }

    /// Claim the lowest free id.
    pub fn get(&mut self) -> Result<u32> {
        match self.used.iter().position(|u| !u) {
            Some(idx) => {
                self.used[idx] = true;
                Ok(self.base + idx as u32)
            }
            None => Err(Error::new(
                ErrorKind::ResourceNotAvailable,
                "cannot allocate id",
            )),
        }
    }

    pub fn put(&mut self, id: u32) {
        if let Ok(idx) = self.index(id) {
            debug_assert!(self.used[idx], "double free of id {}", id);
            self.used[idx] = false;
        }
    }

    fn index(&self, id: u32) -> Result<usize> {
        if id < self.base || id >= self.base + self.used.len() as u32 {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("id {} out of range", id),
            ));
        }
        Ok((id - self.base) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocation() {
        let mut map = IdMap::new(4, 4);
        assert_eq!(map.get().unwrap(), 4);
        assert_eq!(map.get().unwrap(), 5);
        map.put(4);
        assert_eq!(map.get().unwrap(), 4);
    }

    #[test]
    fn exhaustion() {
        let mut map = IdMap::new(1, 2);
        map.get().unwrap();
        map.get().unwrap();
        let err = map.get().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceNotAvailable);
    }

    #[test]
    fn restore_conflict() {
        let mut map = IdMap::new(1, 8);
        map.get_at(3).unwrap();
        assert!(map.get_at(3).is_err());
        assert!(map.get_at(0).is_err());
        assert!(map.get_at(9).is_err());
    }
}
