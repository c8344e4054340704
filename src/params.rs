//! 命名参数与参数快照
//!
//! 每个层通过 [`Parameters`] 暴露带名字的参数矩阵，模型据此导出/导入
//! [`ParamSnapshot`]，支持 JSON 与二进制两种格式。

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{Gpt2Error, Result};

/// 可序列化的 Array2 包装器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableArray {
    /// 数据（行优先）
    pub data: Vec<f32>,
    /// 形状 (rows, cols)
    pub shape: (usize, usize),
}

impl SerializableArray {
    /// 从 Array2 创建
    pub fn from_array(arr: &Array2<f32>) -> Self {
        Self {
            data: arr.iter().copied().collect(),
            shape: arr.dim(),
        }
    }

    /// 转换为 Array2
    pub fn to_array(&self) -> Result<Array2<f32>> {
        Ok(Array2::from_shape_vec(self.shape, self.data.clone())?)
    }
}

/// 带名字的参数集合
pub trait Parameters {
    /// 所有参数，名字以 `.` 分隔层级
    fn named_params(&self) -> Vec<(String, &Array2<f32>)>;

    /// 所有参数的可变引用，顺序与 `named_params` 一致
    fn named_params_mut(&mut self) -> Vec<(String, &mut Array2<f32>)>;

    /// 参数总数
    fn param_count(&self) -> usize {
        self.named_params().iter().map(|(_, p)| p.len()).sum()
    }
}

/// 为子模块的参数名加前缀
pub(crate) fn with_prefix<T>(prefix: &str, params: Vec<(String, T)>) -> Vec<(String, T)> {
    params
        .into_iter()
        .map(|(name, p)| (format!("{}.{}", prefix, name), p))
        .collect()
}

/// 参数快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSnapshot {
    pub params: BTreeMap<String, SerializableArray>,
}

impl ParamSnapshot {
    /// 从模块导出
    pub fn capture<M: Parameters + ?Sized>(module: &M) -> Self {
        let params = module
            .named_params()
            .into_iter()
            .map(|(name, p)| (name, SerializableArray::from_array(p)))
            .collect();
        Self { params }
    }

    /// 写回模块
    ///
    /// 快照必须与模块的参数一一对应且形状一致。先校验全部条目再赋值，
    /// 出错时模块保持原样。
    pub fn restore<M: Parameters + ?Sized>(&self, module: &mut M) -> Result<()> {
        let names: BTreeSet<String> = module.named_params().into_iter().map(|(name, _)| name).collect();
        if let Some(extra) = self.params.keys().find(|name| !names.contains(*name)) {
            return Err(Gpt2Error::UnexpectedParam(extra.clone()));
        }

        let mut staged = Vec::with_capacity(names.len());
        for (name, param) in module.named_params() {
            let stored = self
                .params
                .get(&name)
                .ok_or_else(|| Gpt2Error::MissingParam(name.clone()))?;

            if stored.shape != param.dim() {
                return Err(Gpt2Error::shape(format!(
                    "parameter {} has shape {:?}, snapshot has {:?}",
                    name,
                    param.dim(),
                    stored.shape
                )));
            }
            staged.push(stored.to_array()?);
        }

        for ((_, param), value) in module.named_params_mut().into_iter().zip(staged) {
            *param = value;
        }
        Ok(())
    }

    /// 参数总数
    pub fn param_count(&self) -> usize {
        self.params.values().map(|p| p.data.len()).sum()
    }

    /// 保存为 JSON 格式
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// 从 JSON 格式加载
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// 保存为二进制格式（更紧凑）
    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    /// 从二进制格式加载
    pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(bincode::deserialize_from(reader)?)
    }

    /// 按扩展名选择格式：`.json` 为 JSON，其余为二进制
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if is_json(path.as_ref()) {
            self.save_json(path)
        } else {
            self.save_binary(path)
        }
    }

    /// 按扩展名选择格式加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        if is_json(path.as_ref()) {
            Self::load_json(path)
        } else {
            Self::load_binary(path)
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    struct Pair {
        a: Array2<f32>,
        b: Array2<f32>,
    }

    impl Parameters for Pair {
        fn named_params(&self) -> Vec<(String, &Array2<f32>)> {
            vec![("a".to_string(), &self.a), ("b".to_string(), &self.b)]
        }

        fn named_params_mut(&mut self) -> Vec<(String, &mut Array2<f32>)> {
            vec![("a".to_string(), &mut self.a), ("b".to_string(), &mut self.b)]
        }
    }

    fn pair() -> Pair {
        Pair {
            a: arr2(&[[1.0, 2.0], [3.0, 4.0]]),
            b: arr2(&[[5.0, 6.0, 7.0]]),
        }
    }

    #[test]
    fn test_with_prefix() {
        let p = pair();
        let named = with_prefix("layer", p.named_params());
        assert_eq!(named[0].0, "layer.a");
        assert_eq!(named[1].0, "layer.b");
    }

    #[test]
    fn test_capture_restore() {
        let source = pair();
        let snapshot = ParamSnapshot::capture(&source);
        assert_eq!(snapshot.param_count(), 7);
        assert_eq!(source.param_count(), 7);

        let mut target = Pair {
            a: Array2::zeros((2, 2)),
            b: Array2::zeros((1, 3)),
        };
        snapshot.restore(&mut target).unwrap();
        assert_eq!(target.a, source.a);
        assert_eq!(target.b, source.b);
    }

    #[test]
    fn test_restore_rejects_wrong_shape() {
        let snapshot = ParamSnapshot::capture(&pair());
        let mut target = Pair {
            a: Array2::zeros((2, 3)),
            b: Array2::zeros((1, 3)),
        };
        assert!(matches!(snapshot.restore(&mut target), Err(Gpt2Error::ShapeMismatch(_))));
    }

    #[test]
    fn test_restore_reports_missing() {
        let mut snapshot = ParamSnapshot::capture(&pair());
        snapshot.params.remove("b");
        let mut target = pair();
        match snapshot.restore(&mut target) {
            Err(Gpt2Error::MissingParam(name)) => assert_eq!(name, "b"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_restore_rejects_extra_entries() {
        let mut snapshot = ParamSnapshot::capture(&pair());
        snapshot
            .params
            .insert("c".to_string(), SerializableArray::from_array(&Array2::zeros((1, 1))));
        let mut target = pair();
        match snapshot.restore(&mut target) {
            Err(Gpt2Error::UnexpectedParam(name)) => assert_eq!(name, "c"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_failed_restore_leaves_module_untouched() {
        let mut snapshot = ParamSnapshot::capture(&Pair {
            a: Array2::zeros((2, 2)),
            b: Array2::zeros((1, 3)),
        });
        // `a` 可以写回，`b` 形状不对
        snapshot.params.insert(
            "b".to_string(),
            SerializableArray::from_array(&Array2::zeros((3, 1))),
        );
        let mut target = pair();
        assert!(snapshot.restore(&mut target).is_err());
        assert_eq!(target.a, pair().a);
        assert_eq!(target.b, pair().b);
    }

    #[test]
    fn test_save_load_formats() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ParamSnapshot::capture(&pair());

        let json = dir.path().join("weights.json");
        snapshot.save(&json).unwrap();
        assert_eq!(ParamSnapshot::load(&json).unwrap(), snapshot);

        let bin = dir.path().join("weights.bin");
        snapshot.save(&bin).unwrap();
        assert_eq!(ParamSnapshot::load(&bin).unwrap(), snapshot);

        // 二进制文件不是合法 JSON
        assert!(ParamSnapshot::load_json(&bin).is_err());
    }
}
