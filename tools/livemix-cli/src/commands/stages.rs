//! List the stage kinds of the built-in provider.

use livemix_broadcast_engine::builtin_provider;
use livemix_pipeline_core::{Direction, OptionType, Presence, StageDescriptor};

fn describe_type(ty: &OptionType) -> String {
    match ty {
        OptionType::Bool => "bool".to_string(),
        OptionType::Int { min, max } => format!("int [{min}, {max}]"),
        OptionType::Str => "string".to_string(),
        OptionType::Fraction => "fraction".to_string(),
        OptionType::Enum(values) => {
            let values: Vec<String> = values.iter().map(|(nick, v)| format!("{nick}={v}")).collect();
            format!("enum {{{}}}", values.join(", "))
        }
    }
}

pub fn render(descriptor: &StageDescriptor) -> String {
    let mut out = format!("{}: {}\n", descriptor.kind, descriptor.description);
    for port in &descriptor.templates {
        let direction = match port.direction {
            Direction::Input => "in ",
            Direction::Output => "out",
        };
        let presence = match port.presence {
            Presence::Always => "always",
            Presence::Request => "request",
        };
        out.push_str(&format!("  {direction} {:<8} {presence:<7} {}\n", port.name, port.caps));
    }
    for option in &descriptor.options {
        out.push_str(&format!(
            "  --{} <{}> (default {}): {}\n",
            option.key,
            describe_type(&option.ty),
            option.default,
            option.blurb
        ));
    }
    out
}

pub fn run() {
    let provider = builtin_provider();
    for kind in provider.kinds() {
        if let Some(descriptor) = provider.describe(kind) {
            println!("{}", render(&descriptor));
        }
    }
}
