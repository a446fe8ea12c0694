//! Type and method descriptors.
//!
//! Descriptors are compact strings in the module format: `I` int, `D` float,
//! `Z` bool, `V` void (return position only), `Lqualified.name;` reference.
//! A method descriptor is `(` parameter types `)` return type, e.g.
//! `(ILteam.nav.Target;)Z`.

use std::fmt;

/// A single value type as it appears in field and method descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Int,
    Float,
    Bool,
    Void,
    Reference(String),
}

impl TypeDescriptor {
    /// Parse a descriptor that must describe exactly one type.
    pub fn parse(text: &str) -> Result<TypeDescriptor, String> {
        let mut chars = text.chars();
        let ty = parse_one(&mut chars, text)?;
        if chars.next().is_some() {
            return Err(format!("trailing characters in type descriptor '{}'", text));
        }
        Ok(ty)
    }

    /// Whether a value of this type occupies an operand-stack slot.
    pub fn is_value(&self) -> bool {
        !matches!(self, TypeDescriptor::Void)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Int => write!(f, "I"),
            TypeDescriptor::Float => write!(f, "D"),
            TypeDescriptor::Bool => write!(f, "Z"),
            TypeDescriptor::Void => write!(f, "V"),
            TypeDescriptor::Reference(name) => write!(f, "L{};", name),
        }
    }
}

fn parse_one(chars: &mut std::str::Chars<'_>, whole: &str) -> Result<TypeDescriptor, String> {
    match chars.next() {
        Some('I') => Ok(TypeDescriptor::Int),
        Some('D') => Ok(TypeDescriptor::Float),
        Some('Z') => Ok(TypeDescriptor::Bool),
        Some('V') => Ok(TypeDescriptor::Void),
        Some('L') => {
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == ';' {
                    if name.is_empty() {
                        return Err(format!("empty reference name in '{}'", whole));
                    }
                    return Ok(TypeDescriptor::Reference(name));
                }
                name.push(c);
            }
            Err(format!("unterminated reference type in '{}'", whole))
        }
        Some(c) => Err(format!("unknown type code '{}' in '{}'", c, whole)),
        None => Err(format!("empty type in '{}'", whole)),
    }
}

/// Parameter and return shape of a method, parsed from `(...)R` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub params: Vec<TypeDescriptor>,
    pub ret: TypeDescriptor,
}

impl MethodDescriptor {
    pub fn parse(text: &str) -> Result<MethodDescriptor, String> {
        let mut chars = text.chars();
        if chars.next() != Some('(') {
            return Err(format!("method descriptor '{}' must start with '('", text));
        }
        let mut params = Vec::new();
        loop {
            // Peek for the closing paren without consuming a type code.
            let rest = chars.as_str();
            if let Some(stripped) = rest.strip_prefix(')') {
                chars = stripped.chars();
                break;
            }
            if rest.is_empty() {
                return Err(format!("unterminated parameter list in '{}'", text));
            }
            let param = parse_one(&mut chars, text)?;
            if !param.is_value() {
                return Err(format!("void parameter in '{}'", text));
            }
            params.push(param);
        }
        let ret = parse_one(&mut chars, text)?;
        if chars.next().is_some() {
            return Err(format!("trailing characters in '{}'", text));
        }
        Ok(MethodDescriptor { params, ret })
    }

    /// Number of operand-stack values consumed by the parameters.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Whether a call to a method of this shape pushes a result value.
    pub fn returns_value(&self) -> bool {
        self.ret.is_value()
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for p in &self.params {
            write!(f, "{}", p)?;
        }
        write!(f, "){}", self.ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primitive_types() {
        assert_eq!(TypeDescriptor::parse("I").unwrap(), TypeDescriptor::Int);
        assert_eq!(TypeDescriptor::parse("Z").unwrap(), TypeDescriptor::Bool);
        assert_eq!(
            TypeDescriptor::parse("Lteam.Bot;").unwrap(),
            TypeDescriptor::Reference("team.Bot".to_string())
        );
    }

    #[test]
    fn rejects_bad_type_descriptors() {
        assert!(TypeDescriptor::parse("").is_err());
        assert!(TypeDescriptor::parse("Q").is_err());
        assert!(TypeDescriptor::parse("Lteam.Bot").is_err());
        assert!(TypeDescriptor::parse("L;").is_err());
        assert!(TypeDescriptor::parse("II").is_err());
    }

    #[test]
    fn method_descriptor_round_trip() {
        for text in ["()V", "(I)I", "(ILteam.nav.Target;Z)Lcore.String;", "(DD)D"] {
            let parsed = MethodDescriptor::parse(text).unwrap();
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn rejects_bad_method_descriptors() {
        assert!(MethodDescriptor::parse("I").is_err());
        assert!(MethodDescriptor::parse("()").is_err());
        assert!(MethodDescriptor::parse("(V)V").is_err());
        assert!(MethodDescriptor::parse("(I)VX").is_err());
        assert!(MethodDescriptor::parse("(I").is_err());
    }

    #[test]
    fn param_shape_helpers() {
        let d = MethodDescriptor::parse("(IZ)V").unwrap();
        assert_eq!(d.param_count(), 2);
        assert!(!d.returns_value());
        let d = MethodDescriptor::parse("()I").unwrap();
        assert!(d.returns_value());
    }
}
