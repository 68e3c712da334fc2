//! Native library files (`.scibin`).
//!
//! A library file is a bincode-serialized export manifest: the functions a
//! compiled module exposes, with their signatures in a self-contained type
//! description form. Importing installs the exports as foreign functions in
//! a per-library foreign function slot; the embedder registers the
//! implementations with the VM under the same slot.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ast::PointerQual;
use crate::sema::entity::{EntityId, Mutability, QualType};
use crate::sema::symbol_table::SymbolTable;

/// File extension of native library files.
pub const LIBRARY_EXTENSION: &str = "scibin";

/// First foreign function table slot handed out to imported libraries.
/// Slot 0 is the builtins, slot 1 the program's own extern declarations.
pub const FIRST_LIBRARY_SLOT: u8 = 2;

/// Self-contained description of a type crossing a library boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeDesc {
    Void,
    Bool,
    Byte,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    /// `*T` / `*mut T`
    Pointer { pointee: Box<TypeDesc>, mutable: bool },
    /// `[T]` (only meaningful behind a pointer)
    DynArray { elem: Box<TypeDesc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFunction {
    pub name: String,
    pub params: Vec<TypeDesc>,
    pub ret: TypeDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryManifest {
    pub name: String,
    pub exports: Vec<ExportedFunction>,
}

#[derive(Debug)]
pub enum LibraryError {
    NotFound { name: String, searched: Vec<PathBuf> },
    Io(std::io::Error),
    Malformed(String),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::NotFound { name, searched } => {
                write!(f, "library '{}' not found in {:?}", name, searched)
            }
            LibraryError::Io(err) => write!(f, "failed to read library: {}", err),
            LibraryError::Malformed(message) => write!(f, "malformed library: {}", message),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

/// Locate `<name>.scibin` in the search paths and deserialize its manifest.
pub fn find_library(name: &str, search_paths: &[PathBuf]) -> Result<LibraryManifest, LibraryError> {
    let file_name = format!("{}.{}", name, LIBRARY_EXTENSION);
    for dir in search_paths {
        let path = dir.join(&file_name);
        if path.exists() {
            return read_library(&path);
        }
    }
    Err(LibraryError::NotFound { name: name.to_string(), searched: search_paths.to_vec() })
}

pub fn read_library(path: &Path) -> Result<LibraryManifest, LibraryError> {
    let bytes = std::fs::read(path)?;
    bincode::deserialize(&bytes).map_err(|err| LibraryError::Malformed(err.to_string()))
}

pub fn write_library(path: &Path, manifest: &LibraryManifest) -> Result<(), LibraryError> {
    let bytes = bincode::serialize(manifest)
        .map_err(|err| LibraryError::Malformed(err.to_string()))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Materialize a type description as a symbol table type.
pub fn instantiate_type(sym: &mut SymbolTable, desc: &TypeDesc) -> EntityId {
    let b = *sym.builtins();
    match desc {
        TypeDesc::Void => b.void,
        TypeDesc::Bool => b.bool_,
        TypeDesc::Byte => b.byte,
        TypeDesc::Int { width, signed } => match (width, signed) {
            (8, true) => b.s8,
            (16, true) => b.s16,
            (32, true) => b.s32,
            (8, false) => b.u8,
            (16, false) => b.u16,
            (32, false) => b.u32,
            (_, false) => b.u64,
            _ => b.s64,
        },
        TypeDesc::Float { width: 32 } => b.f32,
        TypeDesc::Float { .. } => b.f64,
        TypeDesc::Pointer { pointee, mutable } => {
            let inner = instantiate_type(sym, pointee);
            let base = QualType {
                ty: inner,
                mutability: if *mutable { Mutability::Mut } else { Mutability::Const },
                bind: Default::default(),
            };
            sym.pointer_type(base, PointerQual::Raw)
        }
        TypeDesc::DynArray { elem } => {
            let inner = instantiate_type(sym, elem);
            sym.array_type(inner, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> LibraryManifest {
        LibraryManifest {
            name: "vec".to_string(),
            exports: vec![
                ExportedFunction {
                    name: "length".to_string(),
                    params: vec![TypeDesc::Float { width: 64 }, TypeDesc::Float { width: 64 }],
                    ret: TypeDesc::Float { width: 64 },
                },
                ExportedFunction {
                    name: "fill".to_string(),
                    params: vec![TypeDesc::Pointer {
                        pointee: Box::new(TypeDesc::DynArray {
                            elem: Box::new(TypeDesc::Int { width: 64, signed: true }),
                        }),
                        mutable: true,
                    }],
                    ret: TypeDesc::Void,
                },
            ],
        }
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vec.scibin");
        let original = manifest();
        write_library(&path, &original).unwrap();
        let loaded = read_library(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_find_library_searches_paths() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        write_library(&dir.path().join("vec.scibin"), &manifest()).unwrap();
        let search = vec![other.path().to_path_buf(), dir.path().to_path_buf()];
        assert!(find_library("vec", &search).is_ok());
        assert!(matches!(
            find_library("missing", &search),
            Err(LibraryError::NotFound { .. })
        ));
    }

    #[test]
    fn test_instantiate_types() {
        let mut sym = SymbolTable::new();
        let b = *sym.builtins();
        assert_eq!(instantiate_type(&mut sym, &TypeDesc::Void), b.void);
        let fat = instantiate_type(
            &mut sym,
            &TypeDesc::Pointer {
                pointee: Box::new(TypeDesc::DynArray {
                    elem: Box::new(TypeDesc::Byte),
                }),
                mutable: false,
            },
        );
        assert_eq!(sym.size_of(fat), 16);
    }
}
