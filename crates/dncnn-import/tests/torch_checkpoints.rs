use std::io::Write;
use std::path::Path;

use dncnn_import::checkpoint::{self, CheckpointLayout, ParamTensor, ParameterMap};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

// Pickle streams as written by torch.save (protocol 2). Every tensor lives in its own storage;
// the storage contents are in `storages()`.

/// `torch.save(model.state_dict())`: an `OrderedDict` rebuilt with `BUILD {'_metadata': ...}`,
/// memoized references back to the `OrderedDict` class and storage type.
const BARE_STATE_DICT: &[u8] = b"\x80\x02ccollections\nOrderedDict\nq\x00)Rq\x01(X\x0e\x00\x00\x00dncnn.0.weightq\x02ctor\
    ch._utils\n_rebuild_tensor_v2\nq\x03((X\x07\x00\x00\x00storageq\x04ctorch\nFloatStorage\
    \nq\x05X\x01\x00\x00\x000q\x06X\x03\x00\x00\x00cpuq\x07K\x02tq\x08QK\x00(K\x02K\x01K\x01\
    K\x01tq\x09(K\x01K\x01K\x01K\x01tq\n\x89h\x00)Rq\x0btq\x0cRq\x0dX\x0c\x00\x00\x00dncnn.0\
    .biasq\x0eh\x03((h\x04h\x05X\x01\x00\x00\x001q\x0fh\x07K\x02tq\x10QK\x00K\x02\x85q\x11K\
    \x01\x85q\x12\x89h\x00)Rq\x13tq\x14Rq\x15X\x0e\x00\x00\x00dncnn.1.weightq\x16h\x03((h\
    \x04h\x05X\x01\x00\x00\x005q\x17h\x07K\x02tq\x18QK\x00K\x02\x85q\x19K\x01\x85q\x1a\x89h\
    \x00)Rq\x1btq\x1cRq\x1dX\x0c\x00\x00\x00dncnn.1.biasq\x1eh\x03((h\x04h\x05X\x01\x00\x00\
    \x006q\x1fh\x07K\x02tq QK\x00K\x02\x85q!K\x01\x85q\"\x89h\x00)Rq#tq$Rq%X\x14\x00\x00\x00\
    dncnn.1.running_meanq&h\x03((h\x04h\x05X\x01\x00\x00\x002q'h\x07K\x02tq(QK\x00K\x02\x85q\
    )K\x01\x85q*\x89h\x00)Rq+tq,Rq-X\x13\x00\x00\x00dncnn.1.running_varq.h\x03((h\x04h\x05X\
    \x01\x00\x00\x003q/h\x07K\x02tq0QK\x00K\x02\x85q1K\x01\x85q2\x89h\x00)Rq3tq4Rq5X\x1b\x00\
    \x00\x00dncnn.1.num_batches_trackedq6h\x03((h\x04ctorch\nLongStorage\nq7X\x01\x00\x00\
    \x004q8h\x07K\x01tq9QK\x00))\x89h\x00)Rq:tq;Rq<u}q=X\x09\x00\x00\x00_metadataq>h\x00)Rq?\
    (X\x00\x00\x00\x00q@}qAX\x07\x00\x00\x00versionqBK\x01sX\x05\x00\x00\x00dncnnqC}qDhBK\
    \x01sX\x07\x00\x00\x00dncnn.0qE}qFhBK\x01sX\x07\x00\x00\x00dncnn.1qG}qHhBK\x02sX\x07\x00\
    \x00\x00dncnn.2qI}qJhBK\x01susb.";

/// `torch.save({'epoch': 30, 'state_dict': model.state_dict(), 'optimizer': {'lr': 1e-3}})`.
const WRAPPED_CHECKPOINT: &[u8] = b"\x80\x02}q\x00(X\x05\x00\x00\x00epochq\x01K\x1eX\n\x00\x00\x00state_dictq\x02ccollection\
    s\nOrderedDict\nq\x03)Rq\x04(X\x0e\x00\x00\x00dncnn.0.weightq\x05ctorch._utils\n_rebuild\
    _tensor_v2\nq\x06((X\x07\x00\x00\x00storageq\x07ctorch\nFloatStorage\nq\x08X\x01\x00\x00\
    \x000q\x09X\x03\x00\x00\x00cpuq\nK\x02tq\x0bQK\x00(K\x02K\x01K\x01K\x01tq\x0c(K\x01K\x01\
    K\x01K\x01tq\x0d\x89h\x03)Rq\x0etq\x0fRq\x10X\x0c\x00\x00\x00dncnn.0.biasq\x11h\x06((h\
    \x07h\x08X\x01\x00\x00\x001q\x12h\nK\x02tq\x13QK\x00K\x02\x85q\x14K\x01\x85q\x15\x89h\
    \x03)Rq\x16tq\x17Rq\x18X\x0e\x00\x00\x00dncnn.1.weightq\x19h\x06((h\x07h\x08X\x01\x00\
    \x00\x005q\x1ah\nK\x02tq\x1bQK\x00K\x02\x85q\x1cK\x01\x85q\x1d\x89h\x03)Rq\x1etq\x1fRq X\
    \x0c\x00\x00\x00dncnn.1.biasq!h\x06((h\x07h\x08X\x01\x00\x00\x006q\"h\nK\x02tq#QK\x00K\
    \x02\x85q$K\x01\x85q%\x89h\x03)Rq&tq'Rq(X\x14\x00\x00\x00dncnn.1.running_meanq)h\x06((h\
    \x07h\x08X\x01\x00\x00\x002q*h\nK\x02tq+QK\x00K\x02\x85q,K\x01\x85q-\x89h\x03)Rq.tq/Rq0X\
    \x13\x00\x00\x00dncnn.1.running_varq1h\x06((h\x07h\x08X\x01\x00\x00\x003q2h\nK\x02tq3QK\
    \x00K\x02\x85q4K\x01\x85q5\x89h\x03)Rq6tq7Rq8X\x1b\x00\x00\x00dncnn.1.num_batches_tracke\
    dq9h\x06((h\x07ctorch\nLongStorage\nq:X\x01\x00\x00\x004q;h\nK\x01tq<QK\x00))\x89h\x03)R\
    q=tq>Rq?u}q@X\x09\x00\x00\x00_metadataqAh\x03)RqB(X\x00\x00\x00\x00qC}qDX\x07\x00\x00\
    \x00versionqEK\x01sX\x05\x00\x00\x00dncnnqF}qGhEK\x01sX\x07\x00\x00\x00dncnn.0qH}qIhEK\
    \x01sX\x07\x00\x00\x00dncnn.1qJ}qKhEK\x02sX\x07\x00\x00\x00dncnn.2qL}qMhEK\x01susbX\x09\
    \x00\x00\x00optimizerqN}qOX\x02\x00\x00\x00lrqPG?PbM\xd2\xf1\xa9\xfcsu.";

/// `torch.save(model)` for a one block `DnCNN` holding `dncnn = nn.Sequential(conv, bn, relu)`,
/// with `_rebuild_parameter` hooks and the `__builtin__.set` of non persistent buffers.
const FULL_INSTANCE: &[u8] = b"\x80\x02c__main__\nDnCNN\nq\x00)\x81q\x01}q\x02(X\x08\x00\x00\x00trainingq\x03\x89X\x0b\
    \x00\x00\x00_parametersq\x04}q\x05X\x08\x00\x00\x00_buffersq\x06}q\x07X\x1b\x00\x00\x00_\
    non_persistent_buffers_setq\x08c__builtin__\nset\nq\x09]q\n\x85q\x0bRq\x0cX\x13\x00\x00\
    \x00_backward_pre_hooksq\x0dccollections\nOrderedDict\nq\x0e)Rq\x0fX\x0f\x00\x00\x00_bac\
    kward_hooksq\x10h\x0e)Rq\x11X\x16\x00\x00\x00_is_full_backward_hookq\x12NX\x0e\x00\x00\
    \x00_forward_hooksq\x13h\x0e)Rq\x14X\x12\x00\x00\x00_forward_pre_hooksq\x15h\x0e)Rq\x16X\
    \x11\x00\x00\x00_state_dict_hooksq\x17h\x0e)Rq\x18X\x1a\x00\x00\x00_load_state_dict_pre_\
    hooksq\x19h\x0e)Rq\x1aX\x08\x00\x00\x00_modulesq\x1bh\x0e)Rq\x1cX\x05\x00\x00\x00dncnnq\
    \x1dctorch.nn.modules.container\nSequential\nq\x1e)\x81q\x1f}q (h\x03\x89h\x04}q!h\x06}q\
    \"h\x08h\x09]q#\x85q$Rq%h\x0dh\x0e)Rq&h\x10h\x0e)Rq'h\x12Nh\x13h\x0e)Rq(h\x15h\x0e)Rq)h\
    \x17h\x0e)Rq*h\x19h\x0e)Rq+h\x1bh\x0e)Rq,(X\x01\x00\x00\x000q-ctorch.nn.modules.conv\nCo\
    nv2d\nq.)\x81q/}q0(h\x03\x89h\x04}q1(X\x06\x00\x00\x00weightq2ctorch._utils\n_rebuild_pa\
    rameter\nq3ctorch._utils\n_rebuild_tensor_v2\nq4((X\x07\x00\x00\x00storageq5ctorch\nFloa\
    tStorage\nq6X\x01\x00\x00\x000q7X\x03\x00\x00\x00cpuq8K\x02tq9QK\x00(K\x02K\x01K\x01K\
    \x01tq:(K\x01K\x01K\x01K\x01tq;\x89h\x0e)Rq<tq=Rq>\x88h\x0e)Rq?\x87q@RqAX\x04\x00\x00\
    \x00biasqBh3h4((h5h6X\x01\x00\x00\x001qCh8K\x02tqDQK\x00K\x02\x85qEK\x01\x85qF\x89h\x0e)\
    RqGtqHRqI\x88h\x0e)RqJ\x87qKRqLuh\x06}qMh\x08h\x09]qN\x85qORqPh\x0dh\x0e)RqQh\x10h\x0e)R\
    qRh\x12Nh\x13h\x0e)RqSh\x15h\x0e)RqTh\x17h\x0e)RqUh\x19h\x0e)RqVh\x1b}qWX\x0b\x00\x00\
    \x00in_channelsqXK\x01X\x0c\x00\x00\x00out_channelsqYK\x02X\x0b\x00\x00\x00kernel_sizeqZ\
    K\x01K\x01\x86q[X\x06\x00\x00\x00strideq\\h[X\x07\x00\x00\x00paddingq]K\x00K\x00\x86q^X\
    \x08\x00\x00\x00dilationq_h[X\n\x00\x00\x00transposedq`\x89X\x0e\x00\x00\x00output_paddi\
    ngqah^X\x06\x00\x00\x00groupsqbK\x01X\x0c\x00\x00\x00padding_modeqcX\x05\x00\x00\x00zero\
    sqdX \x00\x00\x00_reversed_padding_repeated_twiceqe]qf(K\x00K\x00K\x00K\x00eubX\x01\x00\
    \x00\x001qgctorch.nn.modules.batchnorm\nBatchNorm2d\nqh)\x81qi}qj(h\x03\x89h\x04}qk(h2h3\
    h4((h5h6X\x01\x00\x00\x005qlh8K\x02tqmQK\x00K\x02\x85qnK\x01\x85qo\x89h\x0e)RqptqqRqr\
    \x88h\x0e)Rqs\x87qtRquhBh3h4((h5h6X\x01\x00\x00\x006qvh8K\x02tqwQK\x00K\x02\x85qxK\x01\
    \x85qy\x89h\x0e)Rqztq{Rq|\x88h\x0e)Rq}\x87q~Rq\x7fuh\x06}q\x80(X\x0c\x00\x00\x00running_\
    meanq\x81h4((h5h6X\x01\x00\x00\x002q\x82h8K\x02tq\x83QK\x00K\x02\x85q\x84K\x01\x85q\x85\
    \x89h\x0e)Rq\x86tq\x87Rq\x88X\x0b\x00\x00\x00running_varq\x89h4((h5h6X\x01\x00\x00\x003q\
    \x8ah8K\x02tq\x8bQK\x00K\x02\x85q\x8cK\x01\x85q\x8d\x89h\x0e)Rq\x8etq\x8fRq\x90X\x13\x00\
    \x00\x00num_batches_trackedq\x91h4((h5ctorch\nLongStorage\nq\x92X\x01\x00\x00\x004q\x93h\
    8K\x01tq\x94QK\x00))\x89h\x0e)Rq\x95tq\x96Rq\x97uh\x08h\x09]q\x98\x85q\x99Rq\x9ah\x0dh\
    \x0e)Rq\x9bh\x10h\x0e)Rq\x9ch\x12Nh\x13h\x0e)Rq\x9dh\x15h\x0e)Rq\x9eh\x17h\x0e)Rq\x9fh\
    \x19h\x0e)Rq\xa0h\x1b}q\xa1X\x0c\x00\x00\x00num_featuresq\xa2K\x02X\x03\x00\x00\x00epsq\
    \xa3G?\x1a6\xe2\xeb\x1cC-X\x08\x00\x00\x00momentumq\xa4G?\xeeffffffX\x06\x00\x00\x00affi\
    neq\xa5\x88X\x13\x00\x00\x00track_running_statsq\xa6\x88ubX\x01\x00\x00\x002q\xa7ctorch.\
    nn.modules.activation\nReLU\nq\xa8)\x81q\xa9}q\xaa(h\x03\x89h\x04}q\xabh\x06}q\xach\x08h\
    \x09]q\xad\x85q\xaeRq\xafh\x0dh\x0e)Rq\xb0h\x10h\x0e)Rq\xb1h\x12Nh\x13h\x0e)Rq\xb2h\x15h\
    \x0e)Rq\xb3h\x17h\x0e)Rq\xb4h\x19h\x0e)Rq\xb5h\x1b}q\xb6X\x07\x00\x00\x00inplaceq\xb7\
    \x88ubuubsub.";

fn storages() -> Vec<(&'static str, Vec<u8>)> {
    let float = |values: &[f32]| values.iter().flat_map(|v| v.to_le_bytes()).collect();
    vec![
        ("0", float(&[0.5, -1.5])),
        ("1", float(&[0.25, 0.0])),
        ("2", float(&[1.0, 2.0])),
        ("3", float(&[1.0, 4.0])),
        ("4", 7i64.to_le_bytes().to_vec()),
        ("5", float(&[1.0, 1.0])),
        ("6", float(&[0.0, 0.5])),
    ]
}

fn write_archive(path: &Path, pickle: &[u8]) {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zip = ZipWriter::new(std::fs::File::create(path).unwrap());

    zip.start_file("archive/data.pkl", options).unwrap();
    zip.write_all(pickle).unwrap();
    zip.start_file("archive/byteorder", options).unwrap();
    zip.write_all(b"little").unwrap();
    for (key, bytes) in storages() {
        zip.start_file(format!("archive/data/{key}"), options).unwrap();
        zip.write_all(&bytes).unwrap();
    }
    zip.start_file("archive/version", options).unwrap();
    zip.write_all(b"3\n").unwrap();
    zip.start_file("archive/.data/serialization_id", options).unwrap();
    zip.write_all(b"1234567890").unwrap();
    zip.finish().unwrap();
}

fn load(pickle: &[u8]) -> checkpoint::Checkpoint {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dncnn.pth");
    write_archive(&path, pickle);
    checkpoint::load(&path).unwrap()
}

fn expected() -> ParameterMap {
    let mut params = ParameterMap::new();
    params.insert("dncnn.0.weight", ParamTensor::new(vec![2, 1, 1, 1], vec![0.5, -1.5]));
    params.insert("dncnn.0.bias", ParamTensor::new(vec![2], vec![0.25, 0.0]));
    params.insert("dncnn.1.weight", ParamTensor::new(vec![2], vec![1.0, 1.0]));
    params.insert("dncnn.1.bias", ParamTensor::new(vec![2], vec![0.0, 0.5]));
    params.insert("dncnn.1.running_mean", ParamTensor::new(vec![2], vec![1.0, 2.0]));
    params.insert("dncnn.1.running_var", ParamTensor::new(vec![2], vec![1.0, 4.0]));
    params.insert("dncnn.1.num_batches_tracked", ParamTensor::new(vec![], vec![7.0]));
    params
}

#[test]
fn state_dict_with_metadata_loads_as_bare_mapping() {
    let loaded = load(BARE_STATE_DICT);

    assert_eq!(loaded.layout, CheckpointLayout::BareMapping);
    assert_eq!(loaded.params, expected());
}

#[test]
fn training_checkpoint_loads_its_state_dict() {
    let loaded = load(WRAPPED_CHECKPOINT);

    assert_eq!(
        loaded.layout,
        CheckpointLayout::WrappedMapping {
            key: "state_dict".to_string()
        }
    );
    assert_eq!(loaded.params, expected());
}

#[test]
fn pickled_module_loads_parameters_and_buffers() {
    let loaded = load(FULL_INSTANCE);

    assert_eq!(
        loaded.layout,
        CheckpointLayout::FullInstance {
            class: "__main__.DnCNN".to_string()
        }
    );
    assert_eq!(loaded.params, expected());
}

#[test]
fn metadata_is_not_mistaken_for_a_parameter() {
    let loaded = load(BARE_STATE_DICT);

    assert_eq!(loaded.params.len(), 7);
    assert!(loaded.params.keys().all(|key| key.starts_with("dncnn.")));
}
