use crate::compiler::CompileError;
use crate::vm::RuntimeFault;

pub fn error_code(err: &CompileError) -> &'static str {
    match err {
        CompileError::Parse(_) => "E_PARSE",
        CompileError::DuplicateSymbol { .. } => "E_DUPLICATE_SYMBOL",
        CompileError::UnknownSymbol { .. } => "E_UNKNOWN_SYMBOL",
        CompileError::UnresolvedLabel { .. } => "E_UNRESOLVED_LABEL",
        CompileError::DuplicateLabel { .. } => "E_DUPLICATE_LABEL",
        CompileError::UnknownExternalFunction { .. } => "E_UNKNOWN_EXTERNAL",
        CompileError::TypeMismatch { .. } => "E_TYPE_MISMATCH",
        CompileError::DuplicateStruct { .. } => "E_DUPLICATE_STRUCT",
    }
}

/// Renders a compile error with the offending source line underneath.
pub fn render_compile_error(file_name: &str, source: &str, err: &CompileError) -> String {
    let code_prefix = format!("error[{}]", error_code(err));
    let line = err.line();
    let Some(line_text) = line
        .checked_sub(1)
        .and_then(|index| source.lines().nth(index as usize))
    else {
        return format!("{code_prefix}: {err}");
    };

    let indent = line_text.len() - line_text.trim_start().len();
    let width = line_text.trim().len().max(1);
    let pointer = format!("{}{}", " ".repeat(indent), "^".repeat(width));
    format!("{code_prefix}: {err}\n --> {file_name}:{line}\n  |\n{line:>3} | {line_text}\n  | {pointer}")
}

pub fn render_runtime_fault(fault: &RuntimeFault) -> String {
    format!("runtime error: {fault}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;

    #[test]
    fn highlights_offending_line() {
        let source = "int a;\n  a = b;\n";
        let err = compile_source(source).err().expect("compile should fail");
        let rendered = render_compile_error("inline.gsl", source, &err);
        assert!(rendered.starts_with("error[E_UNKNOWN_SYMBOL]"));
        assert!(rendered.contains("inline.gsl:2"));
        assert!(rendered.contains("  2 |   a = b;"));
        assert!(rendered.ends_with("  |   ^^^^^^"));
    }

    #[test]
    fn falls_back_without_a_line() {
        let err = CompileError::UnknownSymbol {
            name: "x".to_string(),
            line: 0,
        };
        assert_eq!(
            render_compile_error("inline.gsl", "", &err),
            "error[E_UNKNOWN_SYMBOL]: line 0: unknown symbol 'x'"
        );
    }
}
