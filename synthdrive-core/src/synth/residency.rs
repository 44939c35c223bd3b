//! Where a model's weights live between uses.

use tracing::debug;

type LoadFn<M> = Box<dyn Fn() -> anyhow::Result<M> + Send>;

/// A model slot that is either kept on the device for the life of the
/// synthesizer, or rebuilt from its memory-mapped weights for every use and
/// released right after. With the second mode, at most one large module
/// occupies accelerator memory at any moment.
pub struct Resident<M> {
    name: &'static str,
    load: LoadFn<M>,
    pinned: Option<M>,
}

impl<M> Resident<M> {
    pub fn pinned(
        name: &'static str,
        load: impl Fn() -> anyhow::Result<M> + Send + 'static,
    ) -> anyhow::Result<Self> {
        debug!(module = name, "loading pinned module");
        let model = load()?;
        Ok(Self {
            name,
            load: Box::new(load),
            pinned: Some(model),
        })
    }

    pub fn on_demand(
        name: &'static str,
        load: impl Fn() -> anyhow::Result<M> + Send + 'static,
    ) -> Self {
        Self {
            name,
            load: Box::new(load),
            pinned: None,
        }
    }

    pub fn new(
        name: &'static str,
        sequential: bool,
        load: impl Fn() -> anyhow::Result<M> + Send + 'static,
    ) -> anyhow::Result<Self> {
        if sequential {
            Ok(Self::on_demand(name, load))
        } else {
            Self::pinned(name, load)
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// Runs `f` against the module, loading it first when it is not pinned.
    pub fn with<R>(&self, f: impl FnOnce(&M) -> anyhow::Result<R>) -> anyhow::Result<R> {
        match &self.pinned {
            Some(model) => f(model),
            None => {
                debug!(module = self.name, "onloading module");
                let model = (self.load)()?;
                let out = f(&model);
                drop(model);
                debug!(module = self.name, "offloaded module");
                out
            }
        }
    }
}
