use ariadne::{ColorGenerator, Label, Report, ReportKind, Source};

use super::metadata::Span;

pub trait ReportableError: std::error::Error {
    /// message is used for reporting verbose message for ariadne.
    fn get_message(&self) -> String {
        self.to_string()
    }
    /// labels indicate the positions the diagnostic refers to.
    fn get_labels(&self) -> Vec<(Span, String)>;
    /// warnings render as `ReportKind::Warning`, everything else as an error.
    fn is_warning(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct SimpleError {
    pub message: String,
    pub span: Span,
}
impl std::fmt::Display for SimpleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for SimpleError {}
impl ReportableError for SimpleError {
    fn get_labels(&self) -> Vec<(Span, String)> {
        vec![(self.span.clone(), self.message.clone())]
    }
}

pub fn report(src: &str, errs: &[Box<dyn ReportableError>]) {
    let mut colors = ColorGenerator::new();
    for e in errs {
        let kind = if e.is_warning() {
            ReportKind::Warning
        } else {
            ReportKind::Error
        };
        let rawlabels = e.get_labels();
        let labels = rawlabels.iter().map(|(span, message)| {
            Label::new(span.clone())
                .with_message(message)
                .with_color(colors.next())
        });
        let builder = Report::build(kind, (), rawlabels.first().map_or(0, |(s, _)| s.start))
            .with_message(e.get_message())
            .with_labels(labels)
            .finish();
        let _ = builder.eprint(Source::from(src.to_string()));
    }
}

pub fn dump_to_string(errs: &[Box<dyn ReportableError>]) -> String {
    let mut res = String::new();
    for e in errs {
        res += e.get_message().as_str();
        res += "\n";
    }
    res
}
