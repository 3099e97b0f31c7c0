/// Runs a closure when dropped.
///
/// Used where bookkeeping must be undone on every exit path of an async
/// function, including the future being dropped mid-await.
///
/// # Examples
///
/// ```
/// use scriptrun::utils::guard::OnDrop;
///
/// let _guard = OnDrop::new(|| println!("released"));
/// // "released" is printed when `_guard` goes out of scope.
/// ```
pub struct OnDrop<F: FnOnce()> {
    on_drop: Option<F>,
}

impl<F: FnOnce()> OnDrop<F> {
    pub fn new(f: F) -> Self {
        Self { on_drop: Some(f) }
    }

    /// Forget the closure without running it.
    pub fn disarm(mut self) {
        self.on_drop = None;
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_runs_once_on_drop() {
        let count = Cell::new(0);
        {
            let _guard = OnDrop::new(|| count.set(count.get() + 1));
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_disarmed_guard_does_nothing() {
        let count = Cell::new(0);
        OnDrop::new(|| count.set(count.get() + 1)).disarm();
        assert_eq!(count.get(), 0);
    }
}
