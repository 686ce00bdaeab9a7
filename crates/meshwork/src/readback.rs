use std::mem;

/// CPU copy of a GPU buffer that is only refreshed when it is read after becoming stale.
pub(crate) enum ReadCache<T> {
    /// The GPU buffer has been written since the last fetch. The contained memory is reused by
    /// the next fetch.
    Stale(T),
    /// The contents match the GPU buffer.
    Valid(T),
}

impl<T: Default> ReadCache<T> {
    /// Creates a cache whose initial contents are already considered valid.
    pub(crate) fn new(initial: T) -> Self {
        Self::Valid(initial)
    }

    /// Marks the cached contents as outdated.
    pub(crate) fn invalidate(&mut self) {
        if let Self::Valid(data) = self {
            *self = Self::Stale(mem::take(data));
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Returns the cached contents, calling `fetch` to refresh them first if they are stale.
    ///
    /// If `fetch` fails, the cache stays stale and the error is returned.
    pub(crate) fn get_or_fetch<E>(
        &mut self,
        fetch: impl FnOnce(&mut T) -> Result<(), E>,
    ) -> Result<&T, E> {
        if let Self::Stale(data) = self {
            fetch(data)?;
            *self = Self::Valid(mem::take(data));
        }

        match self {
            Self::Valid(data) => Ok(data),
            Self::Stale(_) => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initially_valid() {
        let mut cache = ReadCache::new(vec![0; 4]);
        assert!(cache.is_valid());

        let data = cache
            .get_or_fetch(|_| -> Result<(), ()> { panic!("valid cache was refetched") })
            .unwrap();
        assert_eq!(data, &[0; 4]);
    }

    #[test]
    fn fetches_once_per_invalidation() {
        let mut cache = ReadCache::new(vec![0; 4]);
        let mut fetches = 0;
        let mut fetch = |data: &mut Vec<i32>| -> Result<(), ()> {
            fetches += 1;
            data.fill(fetches);
            Ok(())
        };

        cache.invalidate();
        assert!(!cache.is_valid());
        assert_eq!(cache.get_or_fetch(&mut fetch).unwrap(), &[1; 4]);
        assert_eq!(cache.get_or_fetch(&mut fetch).unwrap(), &[1; 4]);

        cache.invalidate();
        cache.invalidate();
        assert_eq!(cache.get_or_fetch(&mut fetch).unwrap(), &[2; 4]);
        assert_eq!(fetches, 2);
    }

    #[test]
    fn failed_fetch_stays_stale() {
        let mut cache = ReadCache::new(vec![0; 4]);
        cache.invalidate();

        assert_eq!(cache.get_or_fetch(|_| Err("lost")), Err("lost"));
        assert!(!cache.is_valid());

        let data = cache
            .get_or_fetch(|data| -> Result<(), ()> {
                data.fill(7);
                Ok(())
            })
            .unwrap();
        assert_eq!(data, &[7; 4]);
    }
}
