/// Options shared by every stage. Built once in `main` and handed down
/// explicitly, there is no global state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub verbose: bool,
    pub dry_run: bool,
    pub docker: String,
    pub git: String,
}
