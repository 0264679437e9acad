//! Declared input/output extraction across pip kinds, used for worker
//! selection ("prefer the worker already holding the content") and for
//! publishing availability once a pip finishes (§4.7).

use fc_api_types::{ArtifactId, Pip, PipKind};

pub fn declared_inputs(pip: &Pip) -> Vec<ArtifactId> {
    match &pip.kind {
        PipKind::Process(p) => p.inputs.clone(),
        PipKind::CopyFile { source, .. } => vec![source.clone()],
        PipKind::SealDirectory { members, .. } => members.clone(),
        PipKind::WriteFile { .. }
        | PipKind::Ipc { .. }
        | PipKind::Module { .. }
        | PipKind::SpecFile { .. }
        | PipKind::Value { .. }
        | PipKind::HashSourceFile { .. } => vec![],
    }
}

pub fn declared_outputs(pip: &Pip) -> Vec<ArtifactId> {
    match &pip.kind {
        PipKind::Process(p) => p.outputs.clone(),
        PipKind::CopyFile { destination, .. } => vec![destination.clone()],
        PipKind::WriteFile { destination, .. } => vec![destination.clone()],
        PipKind::SealDirectory { directory, .. } => vec![directory.clone()],
        PipKind::Ipc { .. } | PipKind::Module { .. } | PipKind::SpecFile { .. } | PipKind::Value { .. } | PipKind::HashSourceFile { .. } => {
            vec![]
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fc_api_types::PipId;
    use std::path::PathBuf;

    #[test]
    fn copy_file_input_and_output_are_its_endpoints() {
        let pip = Pip {
            id: PipId(1),
            semi_stable_hash: fc_api_types::SemiStableHash(1),
            kind: PipKind::CopyFile {
                source: ArtifactId::File(PathBuf::from("/a")),
                destination: ArtifactId::File(PathBuf::from("/b")),
            },
        };
        assert_eq!(declared_inputs(&pip), vec![ArtifactId::File(PathBuf::from("/a"))]);
        assert_eq!(declared_outputs(&pip), vec![ArtifactId::File(PathBuf::from("/b"))]);
    }

    #[test]
    fn value_pip_has_no_artifacts() {
        let pip = Pip { id: PipId(2), semi_stable_hash: fc_api_types::SemiStableHash(2), kind: PipKind::Value { name: "x".into() } };
        assert!(declared_inputs(&pip).is_empty());
        assert!(declared_outputs(&pip).is_empty());
    }
}
