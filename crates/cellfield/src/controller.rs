//! Drives the engine: steps the field, feeds its mean energy back into the rule and rebuilds
//! everything when the size changes.

use cellfield::{Engine, EngineResult, ExecutionContext, GridBuffer, VariableHandle};
use rand::{rngs::StdRng, SeedableRng as _};

/// Everything needed to build and drive a field.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// Width and height of the field.
    pub size: u32,
    /// Steps per tick.
    pub steps_per_tick: u32,
    /// Steps between reductions. Each one stalls on the device.
    pub reduce_every: u32,
    /// Seed for the initial blobs.
    pub seed: u64,
    /// How many blobs to start with.
    pub blobs: u32,
    /// The field rule.
    pub rule: cellfield_kernel::field::Rule,
}

/// A self-dependent `field` variable and the engine that steps it.
pub struct FieldController {
    /// Kept so that a resize can rebuild on the same device.
    context: ExecutionContext,
    /// How the field was built.
    settings: Settings,
    /// The current engine.
    engine: Engine,
    /// The field variable.
    field: VariableHandle,
    /// Steps taken by the current engine.
    steps: u64,
    /// The most recently reduced mean energy.
    average: f32,
}

impl FieldController {
    /// Seed a field and measure its starting mean.
    pub fn new(context: ExecutionContext, settings: Settings) -> EngineResult<Self> {
        let (engine, field, average) = build(&context, &settings)?;
        Ok(Self {
            context,
            settings,
            engine,
            field,
            steps: 0,
            average,
        })
    }

    /// Step the field, reducing it whenever enough steps have passed. Returns the latest mean
    /// energy, which may be a few steps old.
    pub fn tick(&mut self) -> EngineResult<f32> {
        let reduce_every = u64::from(self.settings.reduce_every.max(1));
        for _ in 0..self.settings.steps_per_tick {
            self.engine.step()?;
            self.steps += 1;
            if self.steps % reduce_every == 0 {
                self.average = self.engine.reduce_variable(self.field)?;
                self.engine
                    .set_uniform(self.field, "average", self.average)?;
            }
        }
        Ok(self.average)
    }

    /// The most recently reduced mean energy.
    pub const fn average(&self) -> f32 {
        self.average
    }

    /// The field's latest generation.
    pub fn field(&self) -> EngineResult<&GridBuffer> {
        self.engine.current_buffer(self.field)
    }

    /// The engine doing the work.
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Throw the field away and seed a new one at a different size.
    pub fn resize(&mut self, size: u32) -> EngineResult<()> {
        tracing::info!("Resizing the field to {size}x{size}");
        self.engine.dispose()?;
        self.settings.size = size;
        let (engine, field, average) = build(&self.context, &self.settings)?;
        self.engine = engine;
        self.field = field;
        self.average = average;
        self.steps = 0;
        Ok(())
    }

    /// Release the engine.
    pub fn dispose(&mut self) -> EngineResult<()> {
        self.engine.dispose()
    }
}

/// A new engine with a freshly seeded field, and the field's mean energy.
fn build(
    context: &ExecutionContext,
    settings: &Settings,
) -> EngineResult<(Engine, VariableHandle, f32)> {
    let mut engine = Engine::new(settings.size, settings.size, context.clone())?;

    let mut initial = engine.create_buffer()?;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    initial.upload(&crate::seed::blobs(
        settings.size,
        settings.size,
        &mut rng,
        settings.blobs,
    ))?;

    let kernel = crate::rule::kernel(context.platform(), &settings.rule)?;
    let field = engine.register_variable(crate::rule::VARIABLE, kernel, &initial)?;
    engine.set_dependencies(field, &[field])?;

    let average = engine.reduce_variable(field)?;
    engine.set_uniform(field, "average", average)?;
    tracing::debug!("Seeded a field with a mean energy of {average}");
    Ok((engine, field, average))
}

#[cfg(test)]
mod test {
    use cellfield::{EngineError, EngineState};

    use super::*;

    fn settings() -> Settings {
        Settings {
            size: 16,
            steps_per_tick: 2,
            reduce_every: 1,
            seed: 7,
            blobs: 3,
            rule: cellfield_kernel::field::Rule {
                radius: 3,
                ..cellfield_kernel::field::Rule::default()
            },
        }
    }

    fn controller(settings: Settings) -> FieldController {
        FieldController::new(ExecutionContext::Host, settings).unwrap()
    }

    #[test]
    fn ticks_feed_the_mean_back() {
        let mut controller = controller(settings());
        let seeded = controller.average();
        assert!(seeded > 0.0);

        let average = controller.tick().unwrap();
        assert_eq!(controller.engine().generation(), 2);
        let kernel = controller.engine().kernel(controller.field).unwrap();
        assert_eq!(kernel.uniform("average"), Some(average));
        assert!((0.0..=1.0).contains(&average));
    }

    #[test]
    fn reductions_are_throttled() {
        let mut controller = controller(Settings {
            steps_per_tick: 1,
            reduce_every: 3,
            ..settings()
        });
        let seeded = controller.average();
        controller.tick().unwrap();
        controller.tick().unwrap();
        assert_eq!(controller.average().to_bits(), seeded.to_bits());
        let third = controller.tick().unwrap();
        assert_ne!(third.to_bits(), seeded.to_bits());
    }

    #[test]
    fn same_settings_same_field() {
        let run = || {
            let mut controller = controller(settings());
            controller.tick().unwrap();
            controller.tick().unwrap();
            controller.field().unwrap().read().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn resizing_starts_over() {
        let mut controller = controller(settings());
        controller.tick().unwrap();
        controller.resize(8).unwrap();
        assert_eq!(controller.engine().generation(), 0);
        assert_eq!(controller.engine().width(), 8);
        assert_eq!(controller.field().unwrap().height(), 8);
        controller.tick().unwrap();
        assert_eq!(controller.engine().generation(), 2);
    }

    #[test]
    fn disposed_controllers_stop() {
        let mut controller = controller(settings());
        controller.dispose().unwrap();
        assert_eq!(controller.engine().state(), EngineState::Disposed);
        assert!(matches!(controller.tick(), Err(EngineError::EngineDisposed)));
    }
}
