//! The reference energy/matter rule, wrapped up as a kernel for either substrate.

use cellfield::{Cell, EngineResult, Kernel, Platform};
use cellfield_kernel::field::{Neighbourhood, Rule, FIELD_WGSL, UNIFORMS};

/// The name the rule's variable must be registered under, since it samples itself by name.
pub const VARIABLE: &str = "field";

/// Build the rule's kernel with its uniforms set from `rule`. The mean energy starts out at the
/// target, until the first reduction says otherwise.
///
/// The host kernel weighs its neighbourhood once, up front, so changing the `radius` uniform
/// afterwards only affects the WGSL kernel.
pub fn kernel(platform: Platform, rule: &Rule) -> EngineResult<Kernel> {
    let mut kernel = match platform {
        Platform::ComputeShader => Kernel::compute_shader(FIELD_WGSL, &UNIFORMS),
        Platform::Host => {
            let neighbourhood = Neighbourhood::new(rule.radius);
            let radius = rule.radius;
            Kernel::host(
                move |cell| {
                    let potential =
                        neighbourhood.potential(|dx, dy| cell.sample(VARIABLE, dx, dy).x);
                    from_uniforms(cell, radius).next(
                        cell.current(VARIABLE),
                        potential,
                        cell.uniform("average"),
                    )
                },
                &UNIFORMS,
            )
        }
    };

    for (name, value) in rule.uniforms(rule.target_mean) {
        kernel.set_uniform(name, value)?;
    }
    Ok(kernel)
}

/// The rule as the kernel's uniforms currently describe it.
fn from_uniforms(cell: &Cell<'_>, radius: u32) -> Rule {
    Rule {
        radius,
        mu: cell.uniform("mu"),
        sigma: cell.uniform("sigma"),
        dt: cell.uniform("dt"),
        decay: cell.uniform("decay"),
        target_mean: cell.uniform("target_mean"),
        feedback: cell.uniform("feedback"),
    }
}

#[cfg(test)]
mod test {
    use cellfield::{Engine, ExecutionContext};

    use super::*;

    #[test]
    fn uniforms_start_from_the_rule() {
        let rule = Rule {
            mu: 0.3,
            ..Rule::default()
        };
        let host = kernel(Platform::Host, &rule).unwrap();
        assert_eq!(host.uniform("mu"), Some(0.3));
        assert_eq!(host.uniform("average"), Some(rule.target_mean));
        assert_eq!(host.uniforms().len(), UNIFORMS.len());

        let shader = kernel(Platform::ComputeShader, &rule).unwrap();
        assert_eq!(shader.platform(), Platform::ComputeShader);
        assert_eq!(shader.uniform("radius"), Some(8.0));
    }

    #[test]
    fn host_rule_evolves_within_range() {
        let rule = Rule {
            radius: 2,
            ..Rule::default()
        };
        let mut engine = Engine::new(8, 8, ExecutionContext::Host).unwrap();
        let mut initial = engine.create_buffer().unwrap();
        let data: Vec<f32> = (0..64_u8)
            .flat_map(|index| [f32::from(index % 5) * 0.05, 0.0, 0.0, 0.0])
            .collect();
        initial.upload(&data).unwrap();
        let field = engine
            .register_variable(VARIABLE, kernel(Platform::Host, &rule).unwrap(), &initial)
            .unwrap();
        engine.set_dependencies(field, &[field]).unwrap();

        engine.step().unwrap();
        let next = engine.current_buffer(field).unwrap().read().unwrap();
        assert_ne!(next, data);
        assert!(next.iter().all(|value| (0.0..=1.0).contains(value)));
    }

    #[test]
    fn stops_growing_when_the_uniforms_say_so() {
        let mut engine = Engine::new(4, 4, ExecutionContext::Host).unwrap();
        let mut initial = engine.create_buffer().unwrap();
        let data: Vec<f32> = std::iter::repeat_n([0.5, 0.25, 0.0, 0.0], 16)
            .flatten()
            .collect();
        initial.upload(&data).unwrap();
        let field = engine
            .register_variable(
                VARIABLE,
                kernel(Platform::Host, &Rule::default()).unwrap(),
                &initial,
            )
            .unwrap();
        engine.set_dependencies(field, &[field]).unwrap();
        engine.set_uniform(field, "dt", 0.0).unwrap();

        engine.step().unwrap();
        assert_eq!(engine.current_buffer(field).unwrap().read().unwrap(), data);
    }
}
